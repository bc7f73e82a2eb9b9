//! Ordered callback registries.
//!
//! Callbacks run in ascending priority order; callbacks sharing a priority
//! run in the order they were added. Readers take a snapshot, so a callback
//! being registered never blocks spans that are already running callbacks.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Runs before [`NORM_PRIORITY`] callbacks.
pub const HIGH_PRIORITY: i32 = 0;
/// Priority of callbacks registered without one.
pub const NORM_PRIORITY: i32 = 10_000;
/// Runs after [`NORM_PRIORITY`] callbacks.
pub const LOW_PRIORITY: i32 = 100_000;

/// A value paired with its priority.
pub struct Prioritized<T: ?Sized> {
    pub priority: i32,
    pub value: Arc<T>,
}

impl<T: ?Sized> Prioritized<T> {
    pub fn new(priority: i32, value: Arc<T>) -> Self {
        Self { priority, value }
    }
}

impl<T: ?Sized> Clone for Prioritized<T> {
    fn clone(&self) -> Self {
        Self {
            priority: self.priority,
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Prioritized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prioritized")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Copy-on-write set of prioritized values.
///
/// Identity is the `Arc` allocation: adding the same `Arc` twice is ignored
/// even with a different priority.
pub struct PrioritizedSet<T: ?Sized> {
    entries: RwLock<Arc<[Prioritized<T>]>>,
}

impl<T: ?Sized> PrioritizedSet<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Returns `false` if `value` was already present.
    pub fn add(&self, priority: i32, value: Arc<T>) -> bool {
        self.add_all([Prioritized::new(priority, value)]) == 1
    }

    /// Adds every value not already present and returns how many were added.
    pub fn add_all(&self, items: impl IntoIterator<Item = Prioritized<T>>) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = entries.to_vec();
        let mut added = 0;
        for item in items {
            if next.iter().any(|e| Arc::ptr_eq(&e.value, &item.value)) {
                continue;
            }
            let at = next.partition_point(|e| e.priority <= item.priority);
            next.insert(at, item);
            added += 1;
        }
        if added > 0 {
            *entries = Arc::from(next);
        }
        added
    }

    /// The current entries, in the order they should run.
    pub fn snapshot(&self) -> Arc<[Prioritized<T>]> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for PrioritizedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for PrioritizedSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(set: &PrioritizedSet<str>) -> Vec<String> {
        set.snapshot().iter().map(|e| e.value.to_string()).collect()
    }

    #[test]
    fn test_ascending_priority_then_insertion_order() {
        let set: PrioritizedSet<str> = PrioritizedSet::new();
        set.add(NORM_PRIORITY, Arc::from("norm-a"));
        set.add(LOW_PRIORITY, Arc::from("low"));
        set.add(HIGH_PRIORITY, Arc::from("high"));
        set.add(NORM_PRIORITY, Arc::from("norm-b"));

        assert_eq!(order(&set), vec!["high", "norm-a", "norm-b", "low"]);
    }

    #[test]
    fn test_same_value_added_once() {
        let set: PrioritizedSet<str> = PrioritizedSet::new();
        let value: Arc<str> = Arc::from("once");
        assert!(set.add(NORM_PRIORITY, Arc::clone(&value)));
        assert!(!set.add(HIGH_PRIORITY, Arc::clone(&value)));
        assert_eq!(set.len(), 1);
        assert_eq!(set.snapshot()[0].priority, NORM_PRIORITY);

        // Equal contents in a different allocation is a different value
        assert!(set.add(NORM_PRIORITY, Arc::from("once")));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_add_all_skips_duplicates() {
        let set: PrioritizedSet<str> = PrioritizedSet::new();
        let shared: Arc<str> = Arc::from("shared");
        set.add(NORM_PRIORITY, Arc::clone(&shared));

        let added = set.add_all([
            Prioritized::new(LOW_PRIORITY, Arc::from("late")),
            Prioritized::new(HIGH_PRIORITY, shared),
            Prioritized::new(HIGH_PRIORITY, Arc::from("early")),
        ]);
        assert_eq!(added, 2);
        assert_eq!(order(&set), vec!["early", "shared", "late"]);
    }

    #[test]
    fn test_snapshot_unaffected_by_later_adds() {
        let set: PrioritizedSet<str> = PrioritizedSet::new();
        set.add(NORM_PRIORITY, Arc::from("first"));
        let snapshot = set.snapshot();
        set.add(HIGH_PRIORITY, Arc::from("second"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(set.len(), 2);
    }
}
