//! Span processing: from "ended" to "batched for delivery".
//!
//! The [`Tracer`] is the [`SpanProcessor`] behind every span the pipeline
//! creates. When a span ends it:
//!
//! 1. claims the span ([`Span::process`]), so it is handled exactly once,
//! 2. applies the [`Sampler`],
//! 3. runs the registered end callbacks, any of which can veto the span,
//! 4. seals the span and pushes it into the [`BatchingCollector`],
//! 5. wakes the worker once the batch is large enough.
//!
//! Everything here runs on the producer thread that ended the span, so it
//! never touches the disk or the network.

use crate::clock;
use crate::collector::BatchingCollector;
use crate::prioritized::{Prioritized, PrioritizedSet, NORM_PRIORITY};
use crate::sampler::Sampler;
use crate::span::{Span, ATTR_CALLBACKS_DURATION};
use crate::worker::WorkerHandle;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::warn;

/// Receives spans once they have ended.
pub trait SpanProcessor: Send + Sync {
    fn on_end(&self, span: Arc<Span>);
}

/// Discards every span.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSpanProcessor;

impl SpanProcessor for NoopSpanProcessor {
    fn on_end(&self, _span: Arc<Span>) {}
}

/// Inspects (and may veto) every sampled span before it is batched.
///
/// Returning `false` drops the span and skips any later callbacks.
/// Attributes may still be modified.
pub trait OnSpanEndCallback: Send + Sync {
    fn on_span_end(&self, span: &Span) -> bool;
}

impl<F> OnSpanEndCallback for F
where
    F: Fn(&Span) -> bool + Send + Sync,
{
    fn on_span_end(&self, span: &Span) -> bool {
        self(span)
    }
}

/// Counters for spans passing through a [`Tracer`].
///
/// Relaxed ordering: these are statistics, not synchronisation.
#[derive(Debug, Default)]
pub struct TracerMetrics {
    spans_ended: AtomicU64,
    spans_sampled_out: AtomicU64,
    spans_rejected: AtomicU64,
    spans_batched: AtomicU64,
}

impl TracerMetrics {
    pub fn spans_ended(&self) -> u64 {
        self.spans_ended.load(Ordering::Relaxed)
    }

    pub fn spans_sampled_out(&self) -> u64 {
        self.spans_sampled_out.load(Ordering::Relaxed)
    }

    /// Spans vetoed by an end callback.
    pub fn spans_rejected(&self) -> u64 {
        self.spans_rejected.load(Ordering::Relaxed)
    }

    pub fn spans_batched(&self) -> u64 {
        self.spans_batched.load(Ordering::Relaxed)
    }
}

/// Configuration for batch collection.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Wake the worker once this many spans are waiting.
    pub batch_size_trigger: usize,
    /// Deliver a non-empty batch once it is at least this old.
    pub batch_timeout: Duration,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            batch_size_trigger: 100,
            batch_timeout: Duration::from_secs(30),
        }
    }
}

/// The pipeline's [`SpanProcessor`].
pub struct Tracer {
    collector: BatchingCollector,
    sampler: Arc<dyn Sampler>,
    callbacks: PrioritizedSet<dyn OnSpanEndCallback>,
    worker: OnceLock<WorkerHandle>,
    config: TracerConfig,
    last_batch_time: AtomicU64,
    force_batch: AtomicBool,
    metrics: TracerMetrics,
}

impl Tracer {
    pub fn new(sampler: Arc<dyn Sampler>, config: TracerConfig) -> Self {
        Self {
            collector: BatchingCollector::new(),
            sampler,
            callbacks: PrioritizedSet::new(),
            worker: OnceLock::new(),
            config,
            last_batch_time: AtomicU64::new(clock::now()),
            force_batch: AtomicBool::new(false),
            metrics: TracerMetrics::default(),
        }
    }

    /// Connects the tracer to the worker it should wake. Only the first call
    /// has any effect.
    pub fn set_worker(&self, worker: WorkerHandle) {
        let _ = self.worker.set(worker);
    }

    /// Registers `callback` at [`NORM_PRIORITY`]. Returns `false` if this
    /// callback was already registered.
    pub fn add_on_end_callback(&self, callback: Arc<dyn OnSpanEndCallback>) -> bool {
        self.callbacks.add(NORM_PRIORITY, callback)
    }

    /// Registers `callback`; lower priorities run first.
    pub fn add_on_end_callback_with_priority(
        &self,
        priority: i32,
        callback: Arc<dyn OnSpanEndCallback>,
    ) -> bool {
        self.callbacks.add(priority, callback)
    }

    pub(crate) fn add_end_callbacks(
        &self,
        callbacks: impl IntoIterator<Item = Prioritized<dyn OnSpanEndCallback>>,
    ) -> usize {
        self.callbacks.add_all(callbacks)
    }

    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        &self.sampler
    }

    pub fn metrics(&self) -> &TracerMetrics {
        &self.metrics
    }

    /// Spans waiting for the next batch.
    pub fn pending(&self) -> usize {
        self.collector.len()
    }

    /// The next batch to deliver, if one is due.
    ///
    /// A batch is due once it reaches the size trigger, once the previous
    /// batch was taken more than the batch timeout ago, or after
    /// [`force_current_batch`](Self::force_current_batch). Spans are
    /// re-sampled with the current probability, which may have changed since
    /// they ended.
    pub fn collect_next_batch(&self) -> Option<Vec<Arc<Span>>> {
        let now = clock::now();
        let age = now.saturating_sub(self.last_batch_time.load(Ordering::Relaxed));
        let forced = self.force_batch.swap(false, Ordering::AcqRel);
        if !forced
            && self.collector.len() < self.config.batch_size_trigger
            && age < u64::try_from(self.config.batch_timeout.as_nanos()).unwrap_or(u64::MAX)
        {
            return None;
        }

        self.last_batch_time.store(now, Ordering::Relaxed);
        Some(self.sampler.sampled(self.collector.take_batch()))
    }

    /// Makes the current batch due immediately and wakes the worker.
    pub fn force_current_batch(&self) {
        self.force_batch.store(true, Ordering::Release);
        self.wake_worker();
    }

    fn wake_worker(&self) {
        if let Some(worker) = self.worker.get() {
            worker.wake();
        }
    }

    fn run_callbacks(&self, span: &Span) -> bool {
        let callbacks = self.callbacks.snapshot();
        if callbacks.is_empty() {
            return true;
        }

        let started = clock::now();
        let mut keep = true;
        for callback in callbacks.iter() {
            match catch_unwind(AssertUnwindSafe(|| callback.value.on_span_end(span))) {
                Ok(true) => {}
                Ok(false) => {
                    keep = false;
                    break;
                }
                Err(_) => warn!(span_name = %span.name(), "span end callback panicked; keeping span"),
            }
        }
        let elapsed = clock::now().saturating_sub(started);
        span.set_internal_attribute(ATTR_CALLBACKS_DURATION, elapsed as i64);
        keep
    }
}

impl SpanProcessor for Tracer {
    fn on_end(&self, span: Arc<Span>) {
        if !span.process() {
            return;
        }
        self.metrics.spans_ended.fetch_add(1, Ordering::Relaxed);

        if !self.sampler.should_keep_span(&span) {
            self.metrics.spans_sampled_out.fetch_add(1, Ordering::Relaxed);
            span.seal();
            return;
        }
        if !self.run_callbacks(&span) {
            self.metrics.spans_rejected.fetch_add(1, Ordering::Relaxed);
            span.seal();
            return;
        }

        span.seal();
        self.collector.add(span);
        self.metrics.spans_batched.fetch_add(1, Ordering::Relaxed);

        if self.collector.len() >= self.config.batch_size_trigger {
            self.wake_worker();
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("pending", &self.collector.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
