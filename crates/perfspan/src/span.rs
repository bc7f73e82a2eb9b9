//! The span record and its lifecycle state machine.
//!
//! # State machine
//!
//! ```text
//!   OPEN ────── block() ─────► OPEN_BLOCKED
//!    │   ◄─── last release ───    │
//!  end()                        end()
//!    ▼                            ▼
//!   ENDING ──── block() ─────► ENDING_BLOCKED
//!    │   ◄─── last release ───    │
//!    ▼                            ▼
//!   ENDED  ◄─── last release ─── ENDED_BLOCKED
//!    │
//!  process()
//!    ▼
//!   PROCESSED
//!
//!   discard(): OPEN | OPEN_BLOCKED | ENDING | ENDING_BLOCKED ──► DISCARDED
//! ```
//!
//! Every transition is a compare-and-retry on a single `AtomicU8`, so
//! producers never take a lock to end or discard a span. The only monitor a
//! span has guards its condition set; it is held for the few instructions it
//! takes to register or release a [`Condition`].
//!
//! A span reaches its [`SpanProcessor`] exactly once: whichever thread wins
//! the CAS into `ENDED` hands it over.

use crate::attributes::{AttributeLimits, AttributeValue, Attributes};
use crate::backoff::Backoff;
use crate::clock;
use crate::condition::{Condition, TimeoutExecutor};
use crate::context;
use crate::invariants::{
    debug_assert_blocked_has_conditions, debug_assert_not_terminal, debug_assert_span_id_nonzero,
};
use crate::processor::SpanProcessor;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Attribute recording the sampling probability applied to a span.
pub const ATTR_SAMPLING_P: &str = "bugsnag.sampling.p";
/// Attribute recording the span category.
pub const ATTR_CATEGORY: &str = "bugsnag.span.category";
/// Attribute marking first-class spans.
pub const ATTR_FIRST_CLASS: &str = "bugsnag.span.first_class";
/// Attribute recording time spent in end callbacks, in nanoseconds.
pub const ATTR_CALLBACKS_DURATION: &str = "bugsnag.span.callbacks_duration";

const NO_END_TIME: u64 = u64::MAX;

/// Longest a condition may hold a span. Longer timeouts are clamped.
pub const MAX_CONDITION_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Identity of a span within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

impl SpanContext {
    /// The all-zero context, meaning "no parent".
    pub const INVALID: SpanContext = SpanContext {
        trace_id: 0,
        span_id: 0,
    };

    pub fn new(trace_id: u128, span_id: u64) -> Self {
        Self { trace_id, span_id }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id != 0 && self.span_id != 0
    }
}

/// Span kind, encoded with OpenTelemetry ordinals on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SpanKind {
    #[default]
    Internal = 1,
    Server = 2,
    Client = 3,
    Producer = 4,
    Consumer = 5,
}

impl SpanKind {
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// What kind of operation a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SpanCategory {
    #[default]
    Custom,
    ViewLoad,
    ViewLoadPhase,
    Network,
    AppStart,
    AppStartPhase,
}

impl SpanCategory {
    /// Value of the `bugsnag.span.category` attribute; custom spans carry none.
    pub fn attribute_value(self) -> Option<&'static str> {
        match self {
            SpanCategory::Custom => None,
            SpanCategory::ViewLoad => Some("view_load"),
            SpanCategory::ViewLoadPhase => Some("view_load_phase"),
            SpanCategory::Network => Some("network"),
            SpanCategory::AppStart => Some("app_start"),
            SpanCategory::AppStartPhase => Some("app_start_phase"),
        }
    }

    /// Categories that carry the first-class marker.
    pub(crate) fn has_first_class_marker(self) -> bool {
        matches!(self, SpanCategory::Custom | SpanCategory::ViewLoad)
    }
}

/// Metric collection requested by the creator of a span. The core records the
/// request; metric sources attach their values as attributes before the span
/// ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpanMetrics {
    pub rendering: bool,
    pub cpu: bool,
    pub memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SpanState {
    Open = 0,
    OpenBlocked = 1,
    Ending = 2,
    EndingBlocked = 3,
    Ended = 4,
    EndedBlocked = 5,
    Discarded = 6,
    Processed = 7,
}

impl SpanState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SpanState::Open,
            1 => SpanState::OpenBlocked,
            2 => SpanState::Ending,
            3 => SpanState::EndingBlocked,
            4 => SpanState::Ended,
            5 => SpanState::EndedBlocked,
            6 => SpanState::Discarded,
            _ => SpanState::Processed,
        }
    }

    pub(crate) fn is_blocked(self) -> bool {
        matches!(
            self,
            SpanState::OpenBlocked | SpanState::EndingBlocked | SpanState::EndedBlocked
        )
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, SpanState::Discarded | SpanState::Processed)
    }

    fn is_open(self) -> bool {
        matches!(self, SpanState::Open | SpanState::OpenBlocked)
    }
}

#[derive(Default)]
struct SpanAttributes {
    values: Attributes,
    custom_keys: Vec<String>,
}

/// Pending conditions; the span's monitor.
#[derive(Default)]
struct Conditions {
    pending: Vec<(u64, Instant)>,
}

/// Everything a span needs from the factory that created it.
pub(crate) struct SpanEnv {
    pub(crate) processor: Arc<dyn SpanProcessor>,
    pub(crate) timeouts: Option<Arc<TimeoutExecutor>>,
    pub(crate) limits: AttributeLimits,
}

pub(crate) struct SpanInit {
    pub(crate) name: String,
    pub(crate) kind: SpanKind,
    pub(crate) category: SpanCategory,
    pub(crate) start_time: u64,
    pub(crate) trace_id: u128,
    pub(crate) parent_span_id: u64,
    pub(crate) make_context: bool,
    pub(crate) metrics: Option<SpanMetrics>,
}

/// A timed operation.
///
/// Spans are always handled through `Arc<Span>`; see
/// [`SpanFactory`](crate::factory::SpanFactory) for creation.
pub struct Span {
    context: SpanContext,
    parent_span_id: u64,
    kind: SpanKind,
    category: SpanCategory,
    start_time: u64,
    make_context: bool,
    metrics: Option<SpanMetrics>,
    sampling_value: f64,

    name: Mutex<String>,
    end_time: AtomicU64,
    condition_end_time: AtomicU64,
    state: AtomicU8,
    attributes: Mutex<SpanAttributes>,
    dropped_attributes: AtomicU32,
    sampling_probability: AtomicU64,
    sealed: AtomicBool,
    conditions: Mutex<Conditions>,

    env: Arc<SpanEnv>,

    /// Intrusive link, owned by the collector while the span is queued.
    pub(crate) next: AtomicPtr<Span>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Span {
    pub(crate) fn new(init: SpanInit, env: Arc<SpanEnv>) -> Arc<Self> {
        let span_id = new_span_id();
        debug_assert_span_id_nonzero!(span_id);

        let trace_id = if init.trace_id == 0 {
            new_trace_id()
        } else {
            init.trace_id
        };

        let span = Arc::new(Span {
            context: SpanContext::new(trace_id, span_id),
            parent_span_id: init.parent_span_id,
            kind: init.kind,
            category: init.category,
            start_time: init.start_time,
            make_context: init.make_context,
            metrics: init.metrics,
            sampling_value: sampling_value(trace_id),
            name: Mutex::new(init.name),
            end_time: AtomicU64::new(NO_END_TIME),
            condition_end_time: AtomicU64::new(0),
            state: AtomicU8::new(SpanState::Open as u8),
            attributes: Mutex::new(SpanAttributes::default()),
            dropped_attributes: AtomicU32::new(0),
            sampling_probability: AtomicU64::new(1.0f64.to_bits()),
            sealed: AtomicBool::new(false),
            conditions: Mutex::new(Conditions::default()),
            env,
            next: AtomicPtr::new(std::ptr::null_mut()),
        });

        if let Some(category) = span.category.attribute_value() {
            span.set_internal_attribute(ATTR_CATEGORY, category);
        }
        if span.make_context {
            context::attach(&span);
        }
        span
    }

    // ---------------------------------------------------------------------
    // Identity and timing
    // ---------------------------------------------------------------------

    pub fn context(&self) -> SpanContext {
        self.context
    }

    pub fn trace_id(&self) -> u128 {
        self.context.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.context.span_id
    }

    /// Parent span id, 0 for a root span.
    pub fn parent_span_id(&self) -> u64 {
        self.parent_span_id
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn category(&self) -> SpanCategory {
        self.category
    }

    pub fn metrics_hint(&self) -> Option<SpanMetrics> {
        self.metrics
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// End time in ticks, extended by any upgraded condition that closed later.
    /// `None` until the span has ended.
    pub fn end_time(&self) -> Option<u64> {
        let natural = self.end_time.load(Ordering::Acquire);
        if natural == NO_END_TIME {
            return None;
        }
        Some(natural.max(self.condition_end_time.load(Ordering::Acquire)))
    }

    pub fn name(&self) -> String {
        lock(&self.name).clone()
    }

    /// Renames the span. Ignored once the span has ended.
    pub fn set_name(&self, name: impl Into<String>) {
        let mut current = lock(&self.name);
        if self.state().is_open() {
            *current = name.into();
        }
    }

    pub fn is_first_class(&self) -> Option<bool> {
        lock(&self.attributes)
            .values
            .get(ATTR_FIRST_CLASS)
            .and_then(AttributeValue::as_bool)
    }

    // ---------------------------------------------------------------------
    // Sampling
    // ---------------------------------------------------------------------

    /// Deterministic value in `[0, 1]` derived from the trace id.
    pub fn sampling_value(&self) -> f64 {
        self.sampling_value
    }

    pub fn sampling_probability(&self) -> f64 {
        f64::from_bits(self.sampling_probability.load(Ordering::Relaxed))
    }

    pub(crate) fn set_sampling_probability(&self, probability: f64) {
        self.sampling_probability
            .store(probability.to_bits(), Ordering::Relaxed);
        self.set_internal_attribute(ATTR_SAMPLING_P, probability);
    }

    // ---------------------------------------------------------------------
    // Attributes
    // ---------------------------------------------------------------------

    /// Sets a custom attribute, subject to the span's [`AttributeLimits`].
    ///
    /// Over-long keys, attributes past the count limit, and any mutation after
    /// the span has been sealed are dropped and counted in
    /// [`dropped_attributes_count`](Self::dropped_attributes_count).
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let limits = self.env.limits;
        if self.is_sealed() || !limits.accepts_key(&key) {
            self.drop_attribute();
            return;
        }

        let mut attrs = lock(&self.attributes);
        if !attrs.values.contains_key(&key) {
            if attrs.custom_keys.len() >= limits.count_limit {
                drop(attrs);
                self.drop_attribute();
                return;
            }
            attrs.custom_keys.push(key.clone());
        }
        attrs.values.insert(key, limits.clamp(value.into()));
    }

    /// Removes an attribute. Ignored once the span has been sealed.
    pub fn remove_attribute(&self, key: &str) -> Option<AttributeValue> {
        if self.is_sealed() {
            return None;
        }
        let mut attrs = lock(&self.attributes);
        attrs.custom_keys.retain(|k| k != key);
        attrs.values.remove(key)
    }

    /// Sets an attribute owned by the pipeline itself, bypassing limits and sealing.
    pub(crate) fn set_internal_attribute(&self, key: &str, value: impl Into<AttributeValue>) {
        lock(&self.attributes).values.insert(key, value);
    }

    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        lock(&self.attributes).values.get(key).cloned()
    }

    /// Snapshot of all attributes in insertion order.
    pub fn attributes(&self) -> Attributes {
        lock(&self.attributes).values.clone()
    }

    pub fn dropped_attributes_count(&self) -> u32 {
        self.dropped_attributes.load(Ordering::Relaxed)
    }

    fn drop_attribute(&self) {
        self.dropped_attributes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub(crate) fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub(crate) fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// `true` once `end` has been called or the span was discarded.
    pub fn is_ended(&self) -> bool {
        !self.state().is_open()
    }

    pub fn is_discarded(&self) -> bool {
        self.state() == SpanState::Discarded
    }

    /// CAS loop applying `step` to the current state.
    ///
    /// Returns `Ok(previous)` when the transition was applied (or `step`
    /// mapped the state onto itself) and `Err(current)` when `step` rejected it.
    fn transition(&self, step: impl Fn(SpanState) -> Option<SpanState>) -> Result<SpanState, SpanState> {
        let mut backoff = Backoff::new();
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = SpanState::from_u8(current);
            let to = step(from).ok_or(from)?;
            if to == from {
                return Ok(from);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug_assert_not_terminal!(from);
                    return Ok(from);
                }
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Ends the span now.
    pub fn end(self: &Arc<Self>) {
        self.end_at(clock::now());
    }

    /// Ends the span at `end_time` ticks. Only the first call has any effect.
    pub fn end_at(self: &Arc<Self>, end_time: u64) {
        self.try_end_at(end_time);
    }

    /// Like [`end_at`](Self::end_at), returning `true` only for the call that
    /// actually ended the span.
    pub fn try_end_at(self: &Arc<Self>, end_time: u64) -> bool {
        let started = self.transition(|s| match s {
            SpanState::Open => Some(SpanState::Ending),
            SpanState::OpenBlocked => Some(SpanState::EndingBlocked),
            _ => None,
        });
        if started.is_err() {
            return false;
        }

        self.end_time.store(end_time, Ordering::Release);
        if self.make_context {
            context::detach(self);
        }

        let finished = self.transition(|s| match s {
            SpanState::Ending => Some(SpanState::Ended),
            SpanState::EndingBlocked => Some(SpanState::EndedBlocked),
            _ => None,
        });
        if finished == Ok(SpanState::Ending) {
            self.env.processor.on_end(Arc::clone(self));
        }
        true
    }

    /// Abandons the span; it will never be delivered.
    ///
    /// Returns `false` if the span had already ended.
    pub fn discard(self: &Arc<Self>) -> bool {
        let cancelled = {
            let mut conditions = lock(&self.conditions);
            let discarded = self.transition(|s| match s {
                SpanState::Open
                | SpanState::OpenBlocked
                | SpanState::Ending
                | SpanState::EndingBlocked
                | SpanState::Discarded => Some(SpanState::Discarded),
                _ => None,
            });
            if discarded.is_err() {
                return false;
            }
            std::mem::take(&mut conditions.pending)
        };

        self.seal();
        if let Some(timeouts) = &self.env.timeouts {
            for (id, deadline) in cancelled {
                timeouts.cancel(deadline, id);
            }
        }
        if self.make_context {
            context::detach(self);
        }
        true
    }

    /// Claims the span for processing. Returns `true` exactly once.
    pub fn process(&self) -> bool {
        self.transition(|s| match s {
            SpanState::Discarded | SpanState::Processed => None,
            _ => Some(SpanState::Processed),
        })
        .is_ok()
    }

    // ---------------------------------------------------------------------
    // Conditions
    // ---------------------------------------------------------------------

    /// Defers delivery of this span until the returned [`Condition`] is closed,
    /// cancelled, or times out.
    ///
    /// Returns `None` if the span can no longer be blocked. Timeouts beyond
    /// [`MAX_CONDITION_TIMEOUT`] are clamped to it.
    pub fn block(self: &Arc<Self>, timeout: Duration) -> Option<Condition> {
        let timeouts = self.env.timeouts.as_ref()?;
        let deadline = Instant::now() + timeout.min(MAX_CONDITION_TIMEOUT);

        let id = {
            let mut conditions = lock(&self.conditions);
            self.transition(|s| match s {
                SpanState::Open => Some(SpanState::OpenBlocked),
                SpanState::Ending => Some(SpanState::EndingBlocked),
                s if s.is_blocked() => Some(s),
                _ => None,
            })
            .ok()?;

            let id = timeouts.next_id();
            conditions.pending.push((id, deadline));
            id
        };

        let condition = Condition::new(id, Arc::clone(self), deadline);
        timeouts.schedule(&condition);
        Some(condition)
    }

    /// Number of conditions still holding the span.
    pub fn pending_conditions(&self) -> usize {
        lock(&self.conditions).pending.len()
    }

    pub(crate) fn has_condition(&self, id: u64) -> bool {
        lock(&self.conditions).pending.iter().any(|(c, _)| *c == id)
    }

    /// Releases condition `id`. When it was the last one the span is unblocked,
    /// and a span already ended is handed to the processor.
    ///
    /// Returns `false` if the condition had already been released.
    pub(crate) fn release_condition(self: &Arc<Self>, id: u64, close_time: Option<u64>) -> bool {
        let flush = {
            let mut conditions = lock(&self.conditions);
            debug_assert_blocked_has_conditions!(self.state(), conditions.pending.len());

            let Some(index) = conditions.pending.iter().position(|(c, _)| *c == id) else {
                return false;
            };
            let (_, deadline) = conditions.pending.swap_remove(index);
            if let Some(timeouts) = &self.env.timeouts {
                timeouts.cancel(deadline, id);
            }
            if let Some(t) = close_time {
                self.condition_end_time.fetch_max(t, Ordering::AcqRel);
            }
            if !conditions.pending.is_empty() {
                return true;
            }

            let unblocked = self.transition(|s| match s {
                SpanState::OpenBlocked => Some(SpanState::Open),
                SpanState::EndingBlocked => Some(SpanState::Ending),
                SpanState::EndedBlocked => Some(SpanState::Ended),
                _ => None,
            });
            unblocked == Ok(SpanState::EndedBlocked)
        };

        if flush {
            self.env.processor.on_end(Arc::clone(self));
        }
        true
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name())
            .field("trace_id", &format_args!("{:032x}", self.context.trace_id))
            .field("span_id", &format_args!("{:016x}", self.context.span_id))
            .field("parent_span_id", &format_args!("{:016x}", self.parent_span_id))
            .field("category", &self.category)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Maps a trace id onto `[0, 1]` for sampling decisions.
///
/// Uses the upper 64 bits shifted right by one, so the value is a
/// non-negative `i64` scaled by `i64::MAX`. Only an all-ones upper half maps
/// to `1.0`; upper bits equal to `i64::MAX` map to `0.5`.
pub fn sampling_value(trace_id: u128) -> f64 {
    let upper = ((trace_id >> 64) as u64) >> 1;
    if upper == 0 {
        return 0.0;
    }
    upper as f64 / i64::MAX as f64
}

fn new_span_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn new_trace_id() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::processor::SpanProcessor;
    use std::sync::atomic::AtomicUsize;

    /// Processor counting how often each span is handed over.
    #[derive(Default)]
    pub(crate) struct CountingProcessor {
        pub(crate) ended: Mutex<Vec<Arc<Span>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl SpanProcessor for CountingProcessor {
        fn on_end(&self, span: Arc<Span>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ended.lock().unwrap().push(span);
        }
    }

    pub(crate) fn test_span(processor: Arc<CountingProcessor>, limits: AttributeLimits) -> Arc<Span> {
        test_span_with(processor, limits, None)
    }

    pub(crate) fn test_span_with(
        processor: Arc<CountingProcessor>,
        limits: AttributeLimits,
        timeouts: Option<Arc<TimeoutExecutor>>,
    ) -> Arc<Span> {
        let env = Arc::new(SpanEnv {
            processor,
            timeouts,
            limits,
        });
        Span::new(
            SpanInit {
                name: "test".into(),
                kind: SpanKind::Internal,
                category: SpanCategory::Custom,
                start_time: 10,
                trace_id: 0,
                parent_span_id: 0,
                make_context: false,
                metrics: None,
            },
            env,
        )
    }

    #[test]
    fn test_end_is_idempotent() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(Arc::clone(&processor), AttributeLimits::default());

        span.end_at(100);
        span.end_at(200);

        assert_eq!(span.end_time(), Some(100));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(span.is_ended());
    }

    #[test]
    fn test_process_is_one_shot() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::default());
        span.end_at(100);
        assert!(span.process());
        assert!(!span.process());
    }

    #[test]
    fn test_discard_prevents_delivery() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(Arc::clone(&processor), AttributeLimits::default());

        assert!(span.discard());
        assert!(span.discard(), "discard is idempotent");
        span.end_at(100);

        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert!(!span.process());
        assert_eq!(span.end_time(), None);
    }

    #[test]
    fn test_discard_after_end_fails() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::default());
        span.end_at(5);
        assert!(!span.discard());
    }

    #[test]
    fn test_name_frozen_after_end() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::default());
        span.set_name("renamed");
        span.end_at(5);
        span.set_name("too late");
        assert_eq!(span.name(), "renamed");
    }

    #[test]
    fn test_count_limit_drops_extra_custom_attributes() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::new(1024, 1000, 2));

        span.set_attribute("a", 1i64);
        span.set_attribute("b", "two");
        span.set_attribute("c", 3.0);
        // Replacing an existing key is always allowed
        span.set_attribute("a", 10i64);

        assert_eq!(span.attribute("a"), Some(AttributeValue::Int(10)));
        assert_eq!(span.attribute("c"), None);
        assert_eq!(span.dropped_attributes_count(), 1);
    }

    #[test]
    fn test_int_attributes_obey_count_limit() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::new(1024, 1000, 1));
        span.set_attribute("first", 1i64);
        span.set_attribute("second", 2i64);
        assert_eq!(span.attribute("second"), None);
        assert_eq!(span.dropped_attributes_count(), 1);
    }

    #[test]
    fn test_oversized_key_and_sealed_mutation_are_counted() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::default());

        span.set_attribute("k".repeat(129), true);
        assert_eq!(span.dropped_attributes_count(), 1);

        span.seal();
        span.set_attribute("late", true);
        assert_eq!(span.attribute("late"), None);
        assert_eq!(span.dropped_attributes_count(), 2);
    }

    #[test]
    fn test_string_attribute_truncated() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::new(4, 1000, 128));
        span.set_attribute("s", "truncate me");
        assert_eq!(
            span.attribute("s"),
            Some(AttributeValue::from("trun*** 7 CHARS TRUNCATED"))
        );
    }

    #[test]
    fn test_internal_attributes_do_not_use_custom_budget() {
        let processor = Arc::new(CountingProcessor::default());
        let span = test_span(processor, AttributeLimits::new(1024, 1000, 1));
        span.set_sampling_probability(0.5);
        span.set_attribute("custom", 1i64);
        assert_eq!(span.dropped_attributes_count(), 0);
        assert_eq!(span.attribute(ATTR_SAMPLING_P), Some(AttributeValue::Double(0.5)));
    }

    #[test]
    fn test_sampling_value_bounds() {
        assert_eq!(sampling_value(0), 0.0);
        assert_eq!(sampling_value(u128::from(u64::MAX)), 0.0);
        assert_eq!(sampling_value(1u128 << 64), 0.0); // shifted out
        assert_eq!(sampling_value(u128::MAX), 1.0);
        let max_i64 = (i64::MAX as u128) << 65;
        assert_eq!(sampling_value(max_i64), 1.0);
        let half = ((i64::MAX as u64 / 2) as u128) << 65;
        assert!((sampling_value(half) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_sampling_value_drops_the_top_bit() {
        // upper64 = i64::MAX: the shift leaves 2^62 - 1, half of i64::MAX
        let upper_i64_max = u128::from(i64::MAX as u64) << 64;
        assert_eq!(sampling_value(upper_i64_max), 0.5);

        // upper64 = u64::MAX is the only way to reach 1.0
        let upper_u64_max = u128::from(u64::MAX) << 64;
        assert_eq!(sampling_value(upper_u64_max), 1.0);

        // The top bit alone shifts to 2^62
        let top_bit_only = 1u128 << 127;
        assert_eq!(sampling_value(top_bit_only), 0.5);
    }

    #[test]
    fn test_span_ids_nonzero_and_distinct() {
        let processor = Arc::new(CountingProcessor::default());
        let a = test_span(Arc::clone(&processor), AttributeLimits::default());
        let b = test_span(processor, AttributeLimits::default());
        assert_ne!(a.span_id(), 0);
        assert_ne!(a.span_id(), b.span_id());
        assert!(a.context().is_valid());
    }

    #[test]
    fn test_kind_ordinals() {
        assert_eq!(SpanKind::Internal.ordinal(), 1);
        assert_eq!(SpanKind::Server.ordinal(), 2);
        assert_eq!(SpanKind::Client.ordinal(), 3);
        assert_eq!(SpanKind::Producer.ordinal(), 4);
        assert_eq!(SpanKind::Consumer.ordinal(), 5);
    }

    #[test]
    fn test_concurrent_end_delivers_once() {
        for _ in 0..50 {
            let processor = Arc::new(CountingProcessor::default());
            let span = test_span(Arc::clone(&processor), AttributeLimits::default());
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let span = Arc::clone(&span);
                    std::thread::spawn(move || span.end_at(100 + i))
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        }
    }
}
