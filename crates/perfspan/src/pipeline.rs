//! Wiring of the whole engine behind one handle.

use crate::attributes::Attributes;
use crate::condition::TimeoutExecutor;
use crate::config::PipelineConfig;
use crate::delivery::{AlwaysConnected, Connectivity, Delivery, RetryDelivery};
use crate::factory::{OnSpanStartCallback, SpanFactory};
use crate::persistence::{Persistence, RetryQueue};
use crate::plugin::PluginManager;
use crate::processor::{OnSpanEndCallback, SpanProcessor, Tracer, TracerConfig};
use crate::sampler::{DiscardingSampler, ProbabilitySampler, Sampler};
use crate::tasks::{RetryDeliveryTask, SamplerTask, SendBatchTask};
use crate::worker::{Task, Worker};
use std::io;
use std::sync::Arc;
use tracing::{debug, info};

pub const SDK_NAME: &str = "perfspan";

/// A running pipeline.
///
/// Dropping the handle stops the worker and the timeout thread; spans still
/// waiting in the batch are not delivered. Call [`flush`](Self::flush) first
/// to send them.
pub struct Pipeline {
    config: PipelineConfig,
    persistence: Persistence,
    tracer: Arc<Tracer>,
    factory: SpanFactory,
    retry_queue: Arc<RetryQueue>,
    timeouts: Arc<TimeoutExecutor>,
    plugins: Arc<PluginManager>,
    worker: Worker,
}

impl Pipeline {
    /// Starts a pipeline that always attempts delivery.
    pub fn start<D: Delivery + 'static>(config: PipelineConfig, delivery: D) -> io::Result<Self> {
        Self::start_with_connectivity(config, delivery, Arc::new(AlwaysConnected))
    }

    /// Starts a pipeline whose retries only run while `connectivity` allows it.
    pub fn start_with_connectivity<D: Delivery + 'static>(
        config: PipelineConfig,
        delivery: D,
        connectivity: Arc<dyn Connectivity>,
    ) -> io::Result<Self> {
        let persistence = Persistence::new(&config.persistence_dir);
        let retry_queue = Arc::new(persistence.retry_queue(config.max_payload_age));

        let adaptive = (config.is_release_stage_enabled() && config.sampling_probability.is_none())
            .then(|| {
                Arc::new(
                    ProbabilitySampler::new(1.0)
                        .with_expire_after(config.probability_expiry)
                        .with_persistent_state(Arc::new(persistence.persistent_state())),
                )
            });
        let sampler: Arc<dyn Sampler> = if !config.is_release_stage_enabled() {
            Arc::new(DiscardingSampler)
        } else if let Some(adaptive) = &adaptive {
            Arc::clone(adaptive) as Arc<dyn Sampler>
        } else {
            Arc::new(ProbabilitySampler::fixed(
                config.sampling_probability.unwrap_or(1.0),
            ))
        };

        let tracer = Arc::new(Tracer::new(
            sampler,
            TracerConfig {
                batch_size_trigger: config.batch_size_trigger,
                batch_timeout: config.batch_timeout,
            },
        ));
        let timeouts = Arc::new(TimeoutExecutor::new());
        let factory = SpanFactory::with_timeouts(
            Arc::clone(&tracer) as Arc<dyn SpanProcessor>,
            config.attribute_limits,
            Arc::clone(&timeouts),
        );

        let mut plugins = PluginManager::new(&config.plugins);
        plugins.install(&config, &factory, &tracer);
        let plugins = Arc::new(plugins);

        let inner: Arc<dyn Delivery> = Arc::new(delivery);
        let retrying: Arc<dyn Delivery> =
            Arc::new(RetryDelivery::new(Arc::clone(&inner), Arc::clone(&retry_queue)));

        let startup = {
            let config = config.clone();
            let persistence = persistence.clone();
            let tracer = Arc::clone(&tracer);
            let retry_queue = Arc::clone(&retry_queue);
            let plugins = Arc::clone(&plugins);
            move || {
                plugins.start();
                let device_id = persistence.device_id().load_device_id();
                let resource = resource_attributes(&config, device_id.as_deref());

                let mut tasks: Vec<Box<dyn Task>> = vec![
                    Box::new(SendBatchTask::new(tracer, retrying, resource)),
                    Box::new(RetryDeliveryTask::new(
                        retry_queue,
                        Arc::clone(&inner),
                        connectivity,
                    )),
                ];
                if let Some(sampler) = adaptive {
                    tasks.push(Box::new(SamplerTask::new(sampler, inner)));
                }
                tasks
            }
        };

        let worker = Worker::new(startup, config.worker_sleep);
        worker.start()?;
        info!(
            release_stage = %config.release_stage,
            persistence = %persistence.root().display(),
            "pipeline started"
        );

        Ok(Self {
            config,
            persistence,
            tracer,
            factory,
            retry_queue,
            timeouts,
            plugins,
            worker,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn span_factory(&self) -> &SpanFactory {
        &self.factory
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        self.tracer.sampler()
    }

    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// See [`SpanFactory::add_on_start_callback`].
    pub fn add_on_start_callback(&self, callback: Arc<dyn OnSpanStartCallback>) -> bool {
        self.factory.add_on_start_callback(callback)
    }

    /// See [`Tracer::add_on_end_callback`].
    pub fn add_on_end_callback(&self, callback: Arc<dyn OnSpanEndCallback>) -> bool {
        self.tracer.add_on_end_callback(callback)
    }

    /// Number of plugins that installed successfully.
    pub fn installed_plugins(&self) -> usize {
        self.plugins.installed()
    }

    /// Runs a worker pass now.
    pub fn wake(&self) {
        self.worker.wake();
    }

    /// Sends whatever is batched on the next worker pass, without waiting
    /// for the size trigger or the batch timeout.
    pub fn flush(&self) {
        self.tracer.force_current_batch();
        self.worker.wake();
    }

    /// Stops the timeout thread and the worker.
    pub fn shutdown(&self) {
        debug!(pending = self.tracer.pending(), "pipeline shutting down");
        self.timeouts.shutdown();
        self.worker.stop();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("tracer", &self.tracer)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Attributes describing the process, sent once per payload.
pub fn resource_attributes(config: &PipelineConfig, device_id: Option<&str>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("deployment.environment", config.release_stage.as_str());
    attributes.insert("service.name", config.service_name.as_str());
    if let Some(version) = &config.app_version {
        attributes.insert("service.version", version.as_str());
    }
    attributes.insert("telemetry.sdk.name", SDK_NAME);
    attributes.insert("telemetry.sdk.version", env!("CARGO_PKG_VERSION"));
    attributes.insert("os.type", std::env::consts::OS);
    attributes.insert("host.arch", std::env::consts::ARCH);
    if let Some(id) = device_id {
        attributes.insert("device.id", id);
    }
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;

    #[test]
    fn test_resource_attributes() {
        let config = PipelineConfig::new("key")
            .with_service_name("checkout")
            .with_app_version("1.2.3");
        let attributes = resource_attributes(&config, Some("device-1"));

        assert_eq!(attributes.get("service.name"), Some(&AttributeValue::from("checkout")));
        assert_eq!(attributes.get("service.version"), Some(&AttributeValue::from("1.2.3")));
        assert_eq!(
            attributes.get("deployment.environment"),
            Some(&AttributeValue::from("production"))
        );
        assert_eq!(attributes.get("device.id"), Some(&AttributeValue::from("device-1")));
        assert_eq!(attributes.get("telemetry.sdk.name"), Some(&AttributeValue::from(SDK_NAME)));
    }

    #[test]
    fn test_resource_attributes_without_optional_values() {
        let attributes = resource_attributes(&PipelineConfig::new("key"), None);
        assert!(!attributes.contains_key("service.version"));
        assert!(!attributes.contains_key("device.id"));
    }
}
