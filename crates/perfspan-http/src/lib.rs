//! HTTP delivery for perfspan.
//!
//! [`HttpDelivery`] posts encoded payloads with `reqwest`. The pipeline calls
//! delivery from its own worker thread, which is not async, so each
//! `HttpDelivery` drives its requests on a private current-thread tokio
//! runtime.
//!
//! Do not call it from inside another tokio runtime: `block_on` would panic.

use perfspan::payload::{HEADER_CONTENT_LENGTH, HEADER_SAMPLING_PROBABILITY};
use perfspan::{
    Attributes, Delivery, DeliveryResult, EncodeError, NewProbabilityCallback, PayloadEncoder,
    PipelineConfig, ResponseClass, Span, TracePayload,
};
use reqwest::header::HeaderMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error types for HTTP delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The private runtime could not be built
    #[error("runtime error: {0}")]
    Runtime(#[from] std::io::Error),
    /// The HTTP client could not be built
    #[error("client error: {0}")]
    Client(reqwest::Error),
    /// The request did not produce a response
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The batch could not be encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodeError),
}

/// Response details the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub sampling_probability: Option<f64>,
}

/// Delivers payloads to an OTLP/JSON trace endpoint.
pub struct HttpDelivery {
    endpoint: String,
    encoder: PayloadEncoder,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    callback: RwLock<Option<Arc<dyn NewProbabilityCallback>>>,
}

impl HttpDelivery {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, DeliveryError> {
        Self::with_timeout(endpoint, api_key, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DeliveryError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(DeliveryError::Client)?;
        Ok(Self {
            endpoint: endpoint.into(),
            encoder: PayloadEncoder::new(api_key),
            client,
            runtime,
            callback: RwLock::new(None),
        })
    }

    /// Endpoint and API key from `config`. The `Bugsnag-Span-Sampling`
    /// header is only sent when the server chooses the probability.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, DeliveryError> {
        Ok(Self::new(&config.endpoint, &config.api_key)?
            .with_sampling_header(config.sampling_probability.is_none()))
    }

    pub fn with_sampling_header(mut self, enabled: bool) -> Self {
        self.encoder = self.encoder.with_sampling_header(enabled);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Posts `payload` and returns the status and any sampling probability
    /// the server reported. The probability is also forwarded to the callback.
    pub fn send(&self, payload: &TracePayload) -> Result<DeliveryResponse, DeliveryError> {
        let mut request = self.client.post(&self.endpoint);
        for (name, value) in &payload.headers {
            // reqwest sets Content-Length from the body
            if name.eq_ignore_ascii_case(HEADER_CONTENT_LENGTH) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        let request = request.body(payload.body.clone());

        let response = self.runtime.block_on(async { request.send().await })?;
        let status = response.status().as_u16();
        let sampling_probability = parse_sampling_probability(response.headers());
        debug!(status, ?sampling_probability, bytes = payload.body.len(), "payload posted");

        if let Some(p) = sampling_probability {
            self.notify_probability(p);
        }
        Ok(DeliveryResponse {
            status,
            sampling_probability,
        })
    }

    fn notify_probability(&self, probability: f64) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback.on_new_probability(probability);
        }
    }
}

impl Delivery for HttpDelivery {
    fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult {
        match self.encoder.encode(spans, resource) {
            Ok(payload) => self.deliver_payload(&payload),
            Err(e) => {
                warn!(error = %e, spans = spans.len(), "could not encode batch; dropping");
                DeliveryResult::Failed {
                    payload: None,
                    can_retry: false,
                }
            }
        }
    }

    fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult {
        match self.send(payload) {
            Ok(response) => ResponseClass::from_status(response.status).into_result(payload),
            Err(e) => {
                warn!(error = %e, "delivery failed; will retry");
                DeliveryResult::Failed {
                    payload: Some(payload.clone()),
                    can_retry: true,
                }
            }
        }
    }

    fn fetch_current_probability(&self) {
        let result = self
            .encoder
            .probability_request()
            .map_err(DeliveryError::from)
            .and_then(|payload| self.send(&payload));
        if let Err(e) = result {
            warn!(error = %e, "could not fetch sampling probability");
        }
    }

    fn set_probability_callback(&self, callback: Arc<dyn NewProbabilityCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn name(&self) -> &str {
        "http"
    }
}

impl std::fmt::Debug for HttpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDelivery")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// `Bugsnag-Sampling-Probability` as a probability in `[0, 1]`.
pub fn parse_sampling_probability(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(HEADER_SAMPLING_PROBABILITY)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|p| (0.0..=1.0).contains(p))
}
