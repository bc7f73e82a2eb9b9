//! Conditions defer a span's delivery past its natural end.
//!
//! A [`Condition`] starts out *provisional*: if it simply times out it is
//! cancelled and the span's end time is unaffected. Once
//! [`upgrade`](Condition::upgrade)d it becomes binding: closing it (or letting
//! it time out) extends the span's end time to the close time when that is
//! later than the span's own end.
//!
//! Deadlines are tracked by a single [`TimeoutExecutor`] thread holding a delay
//! queue ordered by `(deadline, id)`. Releasing a condition early removes its
//! queue entry.

use crate::clock;
use crate::span::{Span, SpanContext};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// A pending hold on a span's delivery.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<ConditionInner>,
}

struct ConditionInner {
    id: u64,
    span: Arc<Span>,
    deadline: Instant,
    upgraded: AtomicBool,
}

impl Condition {
    pub(crate) fn new(id: u64, span: Arc<Span>, deadline: Instant) -> Self {
        Self {
            inner: Arc::new(ConditionInner {
                id,
                span,
                deadline,
                upgraded: AtomicBool::new(false),
            }),
        }
    }

    pub fn span(&self) -> &Arc<Span> {
        &self.inner.span
    }

    pub fn deadline(&self) -> Instant {
        self.inner.deadline
    }

    /// `true` until the condition is closed, cancelled, or times out.
    pub fn is_active(&self) -> bool {
        self.inner.span.has_condition(self.inner.id)
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner.upgraded.load(Ordering::Acquire)
    }

    /// Makes the condition binding and returns the span's context so that the
    /// work it waits on can be parented to the span.
    pub fn upgrade(&self) -> Option<SpanContext> {
        if !self.is_active() {
            return None;
        }
        self.inner.upgraded.store(true, Ordering::Release);
        Some(self.inner.span.context())
    }

    /// Closes the condition now.
    pub fn close(&self) {
        self.close_at(clock::now());
    }

    /// Closes the condition at `end_time` ticks.
    pub fn close_at(&self, end_time: u64) {
        let extend = self.is_upgraded().then_some(end_time);
        self.inner.span.release_condition(self.inner.id, extend);
    }

    /// Releases the condition without touching the span's end time.
    pub fn cancel(&self) {
        self.inner.span.release_condition(self.inner.id, None);
    }

    fn on_timeout(&self) {
        if self.is_upgraded() {
            let at = clock::ticks_from_instant(self.inner.deadline);
            self.inner.span.release_condition(self.inner.id, Some(at));
        } else {
            self.inner.span.release_condition(self.inner.id, None);
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("id", &self.inner.id)
            .field("span_id", &format_args!("{:016x}", self.inner.span.span_id()))
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}

// =============================================================================
// TIMEOUT EXECUTOR
// =============================================================================

struct Queue {
    entries: BTreeMap<(Instant, u64), Condition>,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fires condition deadlines on a dedicated thread.
pub struct TimeoutExecutor {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutExecutor {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BTreeMap::new(),
                running: true,
            }),
            changed: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("perfspan-timeouts".into())
            .spawn(move || run(&worker))
            .map_err(|e| warn!(error = %e, "could not start timeout thread; conditions will not time out"))
            .ok();

        Self {
            shared,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(thread),
        }
    }

    /// Allocates an id unique across every span sharing this executor.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn schedule(&self, condition: &Condition) {
        let mut queue = self.shared.lock();
        if !queue.running {
            return;
        }
        queue
            .entries
            .insert((condition.deadline(), condition.inner.id), condition.clone());
        drop(queue);
        self.shared.changed.notify_one();
    }

    pub(crate) fn cancel(&self, deadline: Instant, id: u64) {
        self.shared.lock().entries.remove(&(deadline, id));
    }

    /// Conditions still waiting for their deadline.
    pub fn pending(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Stops the thread. Pending conditions are dropped without firing.
    pub fn shutdown(&self) {
        let abandoned = {
            let mut queue = self.shared.lock();
            queue.running = false;
            std::mem::take(&mut queue.entries)
        };
        self.shared.changed.notify_all();
        drop(abandoned);

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timeout thread panicked");
            }
        }
    }
}

impl Default for TimeoutExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.lock();
    while queue.running {
        let now = Instant::now();
        let next_deadline = queue.entries.first_key_value().map(|(&(deadline, _), _)| deadline);
        match next_deadline {
            Some(deadline) if deadline <= now => {
                let expired = queue.entries.pop_first();
                drop(queue);
                if let Some((_, condition)) = expired {
                    debug!(?condition, "condition timed out");
                    condition.on_timeout();
                }
                queue = shared.lock();
            }
            Some(deadline) => {
                queue = shared
                    .changed
                    .wait_timeout(queue, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                queue = shared
                    .changed
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::attributes::AttributeLimits;
    use crate::condition::TimeoutExecutor;
    use crate::span::tests::{test_span_with, CountingProcessor};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn blocked_span(
        timeouts: &Arc<TimeoutExecutor>,
    ) -> (Arc<CountingProcessor>, Arc<crate::span::Span>) {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span_with(
            Arc::clone(&processor),
            AttributeLimits::default(),
            Some(Arc::clone(timeouts)),
        );
        (processor, span)
    }

    #[test]
    fn test_upgraded_condition_defers_and_extends_end() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_secs(60)).unwrap();
        assert_eq!(condition.upgrade(), Some(span.context()));

        span.end_at(100);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert!(span.is_ended());

        condition.close_at(250);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(span.end_time(), Some(250));
        assert!(!condition.is_active());
        assert_eq!(timeouts.pending(), 0);
    }

    #[test]
    fn test_condition_closed_before_end_keeps_later_natural_end() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_secs(60)).unwrap();
        condition.upgrade();
        span.end_at(300);
        condition.close_at(200);

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(span.end_time(), Some(300));
    }

    #[test]
    fn test_provisional_close_does_not_extend() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_secs(60)).unwrap();
        span.end_at(100);
        condition.close_at(500);

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(span.end_time(), Some(100));
    }

    #[test]
    fn test_last_of_several_conditions_flushes() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let a = span.block(Duration::from_secs(60)).unwrap();
        let b = span.block(Duration::from_secs(60)).unwrap();
        span.end_at(100);

        a.cancel();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        b.cancel();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        // Releasing again is a no-op
        b.cancel();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_before_end_unblocks() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_secs(60)).unwrap();
        condition.cancel();
        assert_eq!(span.pending_conditions(), 0);

        span.end_at(10);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_flushes_blocked_span() {
        crate::clock::now();
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_millis(20)).unwrap();
        condition.upgrade();
        span.end_at(1);

        let waited = Instant::now();
        while processor.calls.load(Ordering::SeqCst) == 0 {
            assert!(waited.elapsed() < Duration::from_secs(5), "timeout never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!condition.is_active());
        // Upgraded conditions close at their deadline
        assert!(span.end_time().unwrap() > 1);
    }

    #[test]
    fn test_block_fails_once_delivered() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (_processor, span) = blocked_span(&timeouts);
        span.end_at(5);
        assert!(span.block(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_unbounded_timeout_is_clamped() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let before = Instant::now();
        let condition = span.block(Duration::MAX).unwrap();
        let ceiling = before + crate::span::MAX_CONDITION_TIMEOUT + Duration::from_secs(1);
        assert!(condition.deadline() <= ceiling);
        assert!(condition.deadline() > before + Duration::from_secs(60));

        span.end_at(10);
        condition.close();
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discard_cancels_pending_conditions() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (processor, span) = blocked_span(&timeouts);

        let condition = span.block(Duration::from_secs(60)).unwrap();
        assert_eq!(timeouts.pending(), 1);
        assert!(span.discard());

        assert_eq!(timeouts.pending(), 0);
        assert!(!condition.is_active());
        assert!(condition.upgrade().is_none());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let timeouts = Arc::new(TimeoutExecutor::new());
        let (_processor, span) = blocked_span(&timeouts);
        let _condition = span.block(Duration::from_secs(60)).unwrap();
        timeouts.shutdown();
        assert_eq!(timeouts.pending(), 0);
    }
}
