//! Per-thread stack of active span contexts.
//!
//! Each thread sees its own stack. Spans created with `make_context` push
//! themselves on creation and pop themselves on end or discard; new spans use
//! the top of the stack as their default parent.
//!
//! Entries are [`Weak`] references and are pruned lazily: whenever the stack
//! is read, entries whose span has ended (possibly on another thread) or been
//! dropped are removed from the top first, so a dead context is never
//! reported as current.

use crate::span::{Span, SpanCategory, SpanContext};
use std::cell::RefCell;
use std::sync::{Arc, Weak};

/// A stack of span contexts owned by one thread.
#[derive(Debug, Default)]
pub struct SpanContextStack {
    entries: Vec<Weak<Span>>,
}

impl SpanContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, span: &Arc<Span>) {
        self.entries.push(Arc::downgrade(span));
    }

    /// Removes `span` if it is the top-most live entry.
    ///
    /// Ended entries above it are pruned first, which includes `span` itself
    /// once it has ended. If some other live context is on top it stays where
    /// it is.
    pub fn detach(&mut self, span: &Span) {
        self.prune();
        if let Some(top) = self.entries.last() {
            if std::ptr::eq(top.as_ptr(), span) {
                self.entries.pop();
            }
        }
    }

    /// The top-most live span.
    pub fn current(&mut self) -> Option<Arc<Span>> {
        self.prune();
        self.entries.last().and_then(Weak::upgrade)
    }

    pub fn current_context(&mut self) -> Option<SpanContext> {
        self.current().map(|span| span.context())
    }

    /// The top-most live span of `category`.
    pub fn find_span(&mut self, category: SpanCategory) -> Option<Arc<Span>> {
        self.prune();
        self.entries
            .iter()
            .rev()
            .filter_map(Weak::upgrade)
            .find(|span| !span.is_ended() && span.category() == category)
    }

    /// Number of entries, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prune(&mut self) {
        while let Some(top) = self.entries.last() {
            match top.upgrade() {
                Some(span) if !span.is_ended() => return,
                _ => {
                    self.entries.pop();
                }
            }
        }
    }
}

thread_local! {
    static STACK: RefCell<SpanContextStack> = RefCell::new(SpanContextStack::new());
}

/// Runs `f` against the calling thread's stack.
///
/// Returns `None` while the thread's local storage is being torn down.
pub fn with_stack<R>(f: impl FnOnce(&mut SpanContextStack) -> R) -> Option<R> {
    STACK
        .try_with(|stack| stack.try_borrow_mut().ok().map(|mut stack| f(&mut stack)))
        .ok()
        .flatten()
}

/// The calling thread's current span, if any.
pub fn current_span() -> Option<Arc<Span>> {
    with_stack(SpanContextStack::current).flatten()
}

/// The calling thread's current span context, if any.
pub fn current_context() -> Option<SpanContext> {
    with_stack(SpanContextStack::current_context).flatten()
}

pub(crate) fn attach(span: &Arc<Span>) {
    with_stack(|stack| stack.attach(span));
}

pub(crate) fn detach(span: &Span) {
    with_stack(|stack| stack.detach(span));
}
