//! Lock-free accumulation of ended spans.
//!
//! # Protocol
//!
//! The collector is a Treiber-style intrusive stack: every span carries a
//! `next` pointer, and the collector only keeps the head.
//!
//! ```text
//!   head ──► [C] ──► [B] ──► [A] ──► null        (newest first)
//! ```
//!
//! - **Push** (any thread): link the span to the current head, then CAS the
//!   head from that value to the span. On contention, re-read and retry.
//! - **Drain** (worker thread): swap the head for null, which detaches the
//!   whole chain in one step, then walk and unlink it.
//!
//! Nodes are never popped one at a time, so there is no ABA hazard: a pointer
//! observed as head can only have been pushed, not recycled.
//!
//! # Ownership
//!
//! Pushing converts an `Arc<Span>` into a raw pointer with
//! [`Arc::into_raw`]; the chain owns that reference until a drain turns it
//! back into an `Arc` with [`Arc::from_raw`]. Dropping the collector drains
//! whatever is left.
//!
//! # Size accounting
//!
//! `size` is incremented *after* the link CAS and decremented by the number of
//! spans actually drained, so it may briefly undercount (or dip below zero)
//! while pushes race a drain. It is used only as a flush trigger.

use crate::backoff::Backoff;
use crate::span::Span;
use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

/// Lock-free batch of ended spans.
pub struct BatchingCollector {
    /// Cache-padded so producer CAS traffic on `head` does not false-share
    /// with the counter.
    head: CachePadded<AtomicPtr<Span>>,
    size: CachePadded<AtomicIsize>,
}

impl BatchingCollector {
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            size: CachePadded::new(AtomicIsize::new(0)),
        }
    }

    /// Adds a span to the batch.
    ///
    /// A span must be added at most once; the pipeline guarantees this with
    /// [`Span::process`].
    pub fn add(&self, span: Arc<Span>) {
        let node = Arc::into_raw(span).cast_mut();
        let mut backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` came from `Arc::into_raw` above and is not yet
            // reachable by any other thread.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };

            // Release: publishes the `next` link along with the span.
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => {
                    head = actual;
                    backoff.snooze();
                }
            }
        }
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate number of spans waiting.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Detaches everything collected so far, oldest first.
    pub fn take_batch(&self) -> Vec<Arc<Span>> {
        // Acquire: pairs with the Release CAS in `add`.
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut batch = Vec::with_capacity(self.len());

        while !node.is_null() {
            // SAFETY: every node in the detached chain holds one strong count
            // transferred by `add`, and the chain is now exclusively ours.
            let span = unsafe { Arc::from_raw(node) };
            node = span.next.swap(ptr::null_mut(), Ordering::Relaxed);
            batch.push(span);
        }

        self.size.fetch_sub(batch.len() as isize, Ordering::Relaxed);
        batch.reverse();
        batch
    }
}

impl Default for BatchingCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BatchingCollector {
    fn drop(&mut self) {
        drop(self.take_batch());
    }
}

impl std::fmt::Debug for BatchingCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingCollector")
            .field("len", &self.len())
            .finish()
    }
}
