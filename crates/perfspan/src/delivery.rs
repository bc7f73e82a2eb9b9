//! The delivery contract and the retry-queue decorator.

use crate::attributes::Attributes;
use crate::persistence::RetryQueue;
use crate::payload::TracePayload;
use crate::sampler::NewProbabilityCallback;
use crate::span::Span;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    /// `payload` is `None` when the batch could not even be encoded.
    Failed {
        payload: Option<TracePayload>,
        can_retry: bool,
    },
}

impl DeliveryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryResult::Success)
    }

    /// A failure worth persisting for a later attempt.
    pub fn retryable_payload(&self) -> Option<&TracePayload> {
        match self {
            DeliveryResult::Failed {
                payload: Some(payload),
                can_retry: true,
            } => Some(payload),
            _ => None,
        }
    }
}

/// How an HTTP status code maps onto [`DeliveryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// The request is wrong and resending it will not help.
    Permanent,
    Retryable,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => ResponseClass::Success,
            402 | 407 | 408 | 429 => ResponseClass::Retryable,
            400..=499 => ResponseClass::Permanent,
            _ => ResponseClass::Retryable,
        }
    }

    pub fn into_result(self, payload: &TracePayload) -> DeliveryResult {
        match self {
            ResponseClass::Success => DeliveryResult::Success,
            ResponseClass::Permanent => DeliveryResult::Failed {
                payload: Some(payload.clone()),
                can_retry: false,
            },
            ResponseClass::Retryable => DeliveryResult::Failed {
                payload: Some(payload.clone()),
                can_retry: true,
            },
        }
    }
}

/// Ships span batches and payloads to the backend.
///
/// Implementations are called from the worker thread only and may block.
pub trait Delivery: Send + Sync {
    /// Encodes and sends one batch.
    fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult;

    /// Sends an already-encoded payload, typically one read from the retry queue.
    fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult;

    /// Asks the backend for the current sampling probability. The answer
    /// arrives through the probability callback.
    fn fetch_current_probability(&self);

    fn set_probability_callback(&self, _callback: Arc<dyn NewProbabilityCallback>) {}

    /// Returns the delivery name for debugging.
    fn name(&self) -> &str;
}

impl<D: Delivery + ?Sized> Delivery for Arc<D> {
    fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult {
        (**self).deliver_spans(spans, resource)
    }

    fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult {
        (**self).deliver_payload(payload)
    }

    fn fetch_current_probability(&self) {
        (**self).fetch_current_probability();
    }

    fn set_probability_callback(&self, callback: Arc<dyn NewProbabilityCallback>) {
        (**self).set_probability_callback(callback);
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDelivery;

impl Delivery for NullDelivery {
    fn deliver_spans(&self, _spans: &[Arc<Span>], _resource: &Attributes) -> DeliveryResult {
        DeliveryResult::Success
    }

    fn deliver_payload(&self, _payload: &TracePayload) -> DeliveryResult {
        DeliveryResult::Success
    }

    fn fetch_current_probability(&self) {}

    fn name(&self) -> &str {
        "null"
    }
}

// =============================================================================
// RETRY DELIVERY
// =============================================================================

/// A delivery wrapper that persists retryable failures to the [`RetryQueue`].
///
/// Nothing is resent here; the retry task replays queued payloads later
/// through the *inner* delivery, so a payload that fails again is left in
/// the queue rather than written a second time.
///
/// # Example
///
/// ```ignore
/// let delivery = RetryDelivery::new(http, Arc::new(persistence.retry_queue(max_age)));
/// // A 503 leaves the encoded batch in <root>/v1/retry-queue
/// delivery.deliver_spans(&batch, &resource);
/// ```
pub struct RetryDelivery<D> {
    inner: D,
    queue: Arc<RetryQueue>,
    /// Metrics: payloads written to the retry queue
    payloads_queued: AtomicU64,
}

impl<D: Delivery> RetryDelivery<D> {
    pub fn new(inner: D, queue: Arc<RetryQueue>) -> Self {
        Self {
            inner,
            queue,
            payloads_queued: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn payloads_queued(&self) -> u64 {
        self.payloads_queued.load(Ordering::Relaxed)
    }

    fn persist_if_retryable(&self, result: &DeliveryResult) {
        let Some(payload) = result.retryable_payload() else {
            return;
        };
        match self.queue.add(payload) {
            Ok(()) => {
                self.payloads_queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(error = %e, "could not queue payload for retry"),
        }
    }
}

impl<D: Delivery> Delivery for RetryDelivery<D> {
    fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult {
        if spans.is_empty() {
            return DeliveryResult::Success;
        }
        let result = self.inner.deliver_spans(spans, resource);
        self.persist_if_retryable(&result);
        result
    }

    fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult {
        let result = self.inner.deliver_payload(payload);
        self.persist_if_retryable(&result);
        result
    }

    fn fetch_current_probability(&self) {
        self.inner.fetch_current_probability();
    }

    fn set_probability_callback(&self, callback: Arc<dyn NewProbabilityCallback>) {
        self.inner.set_probability_callback(callback);
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

// =============================================================================
// CONNECTIVITY
// =============================================================================

/// Whether it is worth trying the network right now.
pub trait Connectivity: Send + Sync {
    fn should_attempt_delivery(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConnected;

impl Connectivity for AlwaysConnected {
    fn should_attempt_delivery(&self) -> bool {
        true
    }
}

/// Connectivity flipped by whoever watches the network.
#[derive(Debug)]
pub struct ConnectivityFlag {
    connected: AtomicBool,
}

impl ConnectivityFlag {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityFlag {
    fn should_attempt_delivery(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::payload::PayloadEncoder;
    use std::collections::VecDeque;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Answers deliveries from a script, then with `Success`, and records
    /// every attempt.
    #[derive(Default)]
    pub(crate) struct ScriptedDelivery {
        pub(crate) script: Mutex<VecDeque<ResponseClass>>,
        pub(crate) span_batches: Mutex<Vec<Vec<String>>>,
        pub(crate) payloads: Mutex<Vec<TracePayload>>,
        pub(crate) probability_fetches: AtomicU64,
        pub(crate) callback: Mutex<Option<Arc<dyn NewProbabilityCallback>>>,
    }

    impl ScriptedDelivery {
        pub(crate) fn with_script(script: impl IntoIterator<Item = ResponseClass>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                ..Self::default()
            }
        }

        fn next_class(&self) -> ResponseClass {
            self.script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
                .unwrap_or(ResponseClass::Success)
        }
    }

    impl Delivery for ScriptedDelivery {
        fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult {
            self.span_batches
                .lock()
                .unwrap()
                .push(spans.iter().map(|s| s.name()).collect());
            let payload = PayloadEncoder::new("key").encode(spans, resource).unwrap();
            self.next_class().into_result(&payload)
        }

        fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult {
            self.payloads.lock().unwrap().push(payload.clone());
            self.next_class().into_result(payload)
        }

        fn fetch_current_probability(&self) {
            self.probability_fetches.fetch_add(1, Ordering::SeqCst);
        }

        fn set_probability_callback(&self, callback: Arc<dyn NewProbabilityCallback>) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn ended_span(name: &str) -> Arc<Span> {
        use crate::attributes::AttributeLimits;
        use crate::factory::{SpanFactory, SpanOptions};
        use crate::processor::NoopSpanProcessor;

        let factory = SpanFactory::new(Arc::new(NoopSpanProcessor), AttributeLimits::default());
        let span = factory.create_span(name, SpanOptions::default().make_context(false));
        span.end();
        span
    }

    fn retry_delivery(
        script: impl IntoIterator<Item = ResponseClass>,
    ) -> (tempfile::TempDir, RetryDelivery<ScriptedDelivery>) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(RetryQueue::new(dir.path(), Duration::from_secs(3600)));
        (dir, RetryDelivery::new(ScriptedDelivery::with_script(script), queue))
    }

    #[test]
    fn test_classification() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(202), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(400), ResponseClass::Permanent);
        assert_eq!(ResponseClass::from_status(401), ResponseClass::Permanent);
        assert_eq!(ResponseClass::from_status(404), ResponseClass::Permanent);
        for status in [402, 407, 408, 429, 500, 503, 302] {
            assert_eq!(ResponseClass::from_status(status), ResponseClass::Retryable, "{status}");
        }
    }

    #[test]
    fn test_empty_batch_is_success_without_io() {
        let (_dir, delivery) = retry_delivery([ResponseClass::Retryable]);
        assert!(delivery.deliver_spans(&[], &Attributes::new()).is_success());
        assert!(delivery.inner().span_batches.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retryable_failure_is_queued() {
        let (_dir, delivery) = retry_delivery([ResponseClass::Retryable]);
        let result = delivery.deliver_spans(&[ended_span("a")], &Attributes::new());

        assert!(result.retryable_payload().is_some());
        assert_eq!(delivery.payloads_queued(), 1);
        let queued = delivery.retry_queue().next().unwrap();
        assert_eq!(Some(&queued), result.retryable_payload());
    }

    #[test]
    fn test_permanent_failure_and_success_not_queued() {
        let (_dir, delivery) = retry_delivery([ResponseClass::Permanent, ResponseClass::Success]);
        let resource = Attributes::new();

        let permanent = delivery.deliver_spans(&[ended_span("a")], &resource);
        assert!(matches!(permanent, DeliveryResult::Failed { can_retry: false, .. }));
        assert!(delivery.deliver_spans(&[ended_span("b")], &resource).is_success());

        assert_eq!(delivery.payloads_queued(), 0);
        assert!(delivery.retry_queue().is_empty());
    }

    #[test]
    fn test_connectivity_flag() {
        let flag = ConnectivityFlag::default();
        assert!(flag.should_attempt_delivery());
        flag.set_connected(false);
        assert!(!flag.should_attempt_delivery());
        assert!(AlwaysConnected.should_attempt_delivery());
    }
}
