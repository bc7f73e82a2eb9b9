//! Pipeline configuration.

use crate::attributes::AttributeLimits;
use crate::plugin::{Plugin, PluginTable};
use crate::sampler::DEFAULT_PROBABILITY_EXPIRY;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://otlp.bugsnag.com/v1/traces";

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Project API key, sent with every payload.
    pub api_key: String,

    /// Trace ingestion endpoint.
    ///
    /// Default: `https://otlp.bugsnag.com/v1/traces`
    pub endpoint: String,

    pub service_name: String,

    /// Reported as `deployment.environment`.
    ///
    /// Default: `"production"`
    pub release_stage: String,

    pub app_version: Option<String>,

    /// Release stages that deliver spans. `None` enables every stage.
    pub enabled_release_stages: Option<Vec<String>>,

    /// Pins the sampling probability. `None` lets the server choose.
    pub sampling_probability: Option<f64>,

    pub attribute_limits: AttributeLimits,

    /// Spans in a batch before the worker is woken early.
    ///
    /// Default: 100
    pub batch_size_trigger: usize,

    /// Maximum age of a batch before it is sent regardless of size.
    ///
    /// Default: 30s
    pub batch_timeout: Duration,

    /// Idle wait between worker passes.
    ///
    /// Default: 30s
    pub worker_sleep: Duration,

    /// Retry payloads older than this are discarded.
    ///
    /// Default: 24h
    pub max_payload_age: Duration,

    /// How long a server-supplied sampling probability stays valid.
    ///
    /// Default: 24h
    pub probability_expiry: Duration,

    /// Root of the on-disk state (retry queue, sampling state, device id).
    pub persistence_dir: PathBuf,

    /// Plugins installed when the pipeline starts, in this order.
    pub plugins: PluginTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            service_name: "unknown_service".to_owned(),
            release_stage: "production".to_owned(),
            app_version: None,
            enabled_release_stages: None,
            sampling_probability: None,
            attribute_limits: AttributeLimits::default(),
            batch_size_trigger: 100,
            batch_timeout: Duration::from_secs(30),
            worker_sleep: Duration::from_secs(30),
            max_payload_age: Duration::from_secs(24 * 60 * 60),
            probability_expiry: DEFAULT_PROBABILITY_EXPIRY,
            persistence_dir: std::env::temp_dir().join("perfspan"),
            plugins: PluginTable::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Short sleeps and a `development` release stage, for local runs.
    pub fn development(api_key: impl Into<String>) -> Self {
        Self {
            release_stage: "development".to_owned(),
            worker_sleep: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(5),
            ..Self::new(api_key)
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_release_stage(mut self, stage: impl Into<String>) -> Self {
        self.release_stage = stage.into();
        self
    }

    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    pub fn with_enabled_release_stages<I, S>(mut self, stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enabled_release_stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sampling_probability(mut self, probability: f64) -> Self {
        self.sampling_probability = Some(probability);
        self
    }

    pub fn with_attribute_limits(mut self, limits: AttributeLimits) -> Self {
        self.attribute_limits = limits;
        self
    }

    pub fn with_batch_size_trigger(mut self, trigger: usize) -> Self {
        self.batch_size_trigger = trigger.max(1);
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_worker_sleep(mut self, sleep: Duration) -> Self {
        self.worker_sleep = sleep;
        self
    }

    pub fn with_max_payload_age(mut self, age: Duration) -> Self {
        self.max_payload_age = age;
        self
    }

    pub fn with_probability_expiry(mut self, expiry: Duration) -> Self {
        self.probability_expiry = expiry;
        self
    }

    pub fn with_persistence_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistence_dir = dir.into();
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Whether spans recorded in the current release stage are delivered.
    pub fn is_release_stage_enabled(&self) -> bool {
        self.enabled_release_stages
            .as_ref()
            .map_or(true, |stages| stages.iter().any(|s| *s == self.release_stage))
    }
}
