//! Binds spans to externally owned tokens.
//!
//! Instrumentation often has no convenient place to keep the span it created
//! for some platform object (a screen, a request). A [`SpanTracker`] keeps the
//! association instead, keyed by any hashable token, and lets a later
//! callback end the span, record a provisional end time, or close a span the
//! owner forgot about.

use crate::clock;
use crate::span::Span;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug)]
struct SpanBinding {
    span: Arc<Span>,
    auto_end_time: Option<u64>,
}

/// Token → span associations.
#[derive(Debug)]
pub struct SpanTracker<K> {
    bindings: RwLock<HashMap<K, SpanBinding>>,
}

impl<K: Hash + Eq + Clone> SpanTracker<K> {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the span bound to `token`, creating it with `create` if there is
    /// none. When two threads race, the loser's freshly created span is
    /// discarded and both get the winner's span.
    pub fn track(&self, token: K, create: impl FnOnce() -> Arc<Span>) -> Arc<Span> {
        if let Some(existing) = self.get(&token) {
            return existing;
        }

        let created = create();
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = bindings.get(&token) {
            let winner = Arc::clone(&existing.span);
            drop(bindings);
            created.discard();
            return winner;
        }
        bindings.insert(
            token,
            SpanBinding {
                span: Arc::clone(&created),
                auto_end_time: None,
            },
        );
        created
    }

    pub fn get(&self, token: &K) -> Option<Arc<Span>> {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .map(|binding| Arc::clone(&binding.span))
    }

    /// Records when the span would have ended automatically, without ending it.
    pub fn mark_automatic_end(&self, token: &K, end_time: u64) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = bindings.get_mut(token) {
            binding.auto_end_time = Some(end_time);
        }
    }

    /// The token's owner went away: unbind the span and, if it is still open,
    /// end it at the recorded automatic end time (or now).
    ///
    /// Returns `true` if an open span was closed.
    pub fn mark_leaked(&self, token: &K) -> bool {
        let Some(binding) = self.remove(token) else {
            return false;
        };
        binding
            .span
            .try_end_at(binding.auto_end_time.unwrap_or_else(clock::now))
    }

    /// Unbinds and ends the span at `end_time` ticks.
    pub fn end_span(&self, token: &K, end_time: u64) {
        if let Some(binding) = self.remove(token) {
            binding.span.end_at(end_time);
        }
    }

    /// Unbinds and discards the span.
    pub fn discard_span(&self, token: &K) {
        if let Some(binding) = self.remove(token) {
            binding.span.discard();
        }
    }

    /// Unbinds the span without touching it.
    pub fn remove_association(&self, token: &K) -> Option<Arc<Span>> {
        self.remove(token).map(|binding| binding.span)
    }

    pub fn len(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, token: &K) -> Option<SpanBinding> {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }
}

impl<K: Hash + Eq + Clone> Default for SpanTracker<K> {
    fn default() -> Self {
        Self::new()
    }
}
