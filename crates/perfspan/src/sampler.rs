//! Trace-id based probability sampling.
//!
//! Every span of a trace has the same [`sampling_value`](crate::span::sampling_value),
//! so a trace is kept or dropped as a whole for any given probability.
//!
//! The probability itself comes from the server (via the
//! `Bugsnag-Sampling-Probability` response header) and is only trusted for a
//! limited time; once it expires the sampler falls back to the configured
//! probability until a fresh value arrives.

use crate::clock;
use crate::persistence::PersistentState;
use crate::span::Span;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default lifetime of a server-supplied probability.
pub const DEFAULT_PROBABILITY_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Receives sampling probabilities reported by the server.
pub trait NewProbabilityCallback: Send + Sync {
    fn on_new_probability(&self, probability: f64);
}

/// Decides which spans are delivered.
pub trait Sampler: Send + Sync {
    /// The probability currently in effect.
    fn probability(&self) -> f64;

    /// Records the current probability on `span` and decides whether to keep it.
    fn should_keep_span(&self, span: &Span) -> bool {
        let p = self.probability();
        span.set_sampling_probability(p);
        p > 0.0 && span.sampling_value() <= p
    }

    /// Filters a batch with [`should_keep_span`](Self::should_keep_span).
    fn sampled(&self, spans: Vec<Arc<Span>>) -> Vec<Arc<Span>> {
        spans
            .into_iter()
            .filter(|span| self.should_keep_span(span))
            .collect()
    }
}

/// Sampler driven by the server's probability, with a configured fallback.
#[derive(Debug)]
pub struct ProbabilitySampler {
    fallback: f64,
    fixed: bool,
    current: AtomicU64,
    expiry_millis: AtomicI64,
    expire_after: Duration,
    state: Option<Arc<PersistentState>>,
}

impl ProbabilitySampler {
    /// An adaptive sampler that uses `fallback` until the server says otherwise.
    pub fn new(fallback: f64) -> Self {
        Self {
            fallback: clamp_probability(fallback),
            fixed: false,
            current: AtomicU64::new(clamp_probability(fallback).to_bits()),
            expiry_millis: AtomicI64::new(0),
            expire_after: DEFAULT_PROBABILITY_EXPIRY,
            state: None,
        }
    }

    /// A sampler pinned to `probability`; server updates are ignored.
    pub fn fixed(probability: f64) -> Self {
        Self {
            fixed: true,
            ..Self::new(probability)
        }
    }

    /// Persists updates to `state` and seeds the current probability from it.
    pub fn with_persistent_state(mut self, state: Arc<PersistentState>) -> Self {
        self.state = Some(state);
        self.restore();
        self
    }

    pub fn with_expire_after(mut self, expire_after: Duration) -> Self {
        self.expire_after = expire_after;
        self
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn expiry_millis(&self) -> i64 {
        self.expiry_millis.load(Ordering::Relaxed)
    }

    /// `true` while a server-supplied probability is in force (always for a
    /// fixed sampler, which never needs one).
    pub fn is_probability_valid(&self) -> bool {
        self.fixed || clock::unix_millis_now() <= self.expiry_millis()
    }

    /// Reloads probability and expiry from the persistent state.
    pub fn restore(&self) {
        if let Some(state) = &self.state {
            let values = state.values();
            self.current
                .store(clamp_probability(values.p_value).to_bits(), Ordering::Relaxed);
            self.expiry_millis
                .store(values.p_value_expiry, Ordering::Relaxed);
        }
    }

    /// Adopts a server-supplied probability for the next `expire_after`.
    pub fn update_probability(&self, probability: f64) {
        if self.fixed || !(0.0..=1.0).contains(&probability) {
            return;
        }
        let expire_after = i64::try_from(self.expire_after.as_millis()).unwrap_or(i64::MAX);
        let expiry = clock::unix_millis_now().saturating_add(expire_after);
        self.current.store(probability.to_bits(), Ordering::Relaxed);
        self.expiry_millis.store(expiry, Ordering::Relaxed);
        debug!(probability, expiry, "sampling probability updated");

        if let Some(state) = &self.state {
            state.update(|values| {
                values.p_value = probability;
                values.p_value_expiry = expiry;
            });
        }
    }
}

impl Sampler for ProbabilitySampler {
    fn probability(&self) -> f64 {
        if self.fixed || !self.is_probability_valid() {
            return self.fallback;
        }
        f64::from_bits(self.current.load(Ordering::Relaxed))
    }
}

impl NewProbabilityCallback for ProbabilitySampler {
    fn on_new_probability(&self, probability: f64) {
        self.update_probability(probability);
    }
}

/// Drops everything; used when delivery is disabled for the release stage.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingSampler;

impl Sampler for DiscardingSampler {
    fn probability(&self) -> f64 {
        0.0
    }

    fn should_keep_span(&self, _span: &Span) -> bool {
        false
    }

    fn sampled(&self, _spans: Vec<Arc<Span>>) -> Vec<Arc<Span>> {
        Vec::new()
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        1.0
    } else {
        p.clamp(0.0, 1.0)
    }
}
