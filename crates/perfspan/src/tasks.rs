//! The worker's tasks.

use crate::attributes::Attributes;
use crate::delivery::{Connectivity, Delivery, DeliveryResult};
use crate::persistence::RetryQueue;
use crate::processor::Tracer;
use crate::sampler::{NewProbabilityCallback, ProbabilitySampler};
use crate::worker::{Task, WorkerHandle};
use std::sync::Arc;
use tracing::debug;

/// Delivers the tracer's batch whenever one is due.
pub struct SendBatchTask {
    tracer: Arc<Tracer>,
    delivery: Arc<dyn Delivery>,
    resource: Attributes,
}

impl SendBatchTask {
    /// `delivery` should persist retryable failures, i.e. be a
    /// [`RetryDelivery`](crate::delivery::RetryDelivery).
    pub fn new(tracer: Arc<Tracer>, delivery: Arc<dyn Delivery>, resource: Attributes) -> Self {
        Self {
            tracer,
            delivery,
            resource,
        }
    }
}

impl Task for SendBatchTask {
    fn on_attach(&mut self, worker: &WorkerHandle) {
        self.tracer.set_worker(worker.clone());
    }

    fn execute(&mut self) -> bool {
        let Some(batch) = self.tracer.collect_next_batch() else {
            return false;
        };
        if batch.is_empty() {
            return false;
        }
        let result = self.delivery.deliver_spans(&batch, &self.resource);
        debug!(
            spans = batch.len(),
            delivered = result.is_success(),
            delivery = self.delivery.name(),
            "batch sent"
        );
        result.is_success()
    }
}

/// Replays payloads from the retry queue, newest first.
pub struct RetryDeliveryTask {
    queue: Arc<RetryQueue>,
    delivery: Arc<dyn Delivery>,
    connectivity: Arc<dyn Connectivity>,
}

impl RetryDeliveryTask {
    /// `delivery` must not write back to `queue`; a payload that fails again
    /// simply stays where it is.
    pub fn new(
        queue: Arc<RetryQueue>,
        delivery: Arc<dyn Delivery>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            queue,
            delivery,
            connectivity,
        }
    }
}

impl Task for RetryDeliveryTask {
    fn execute(&mut self) -> bool {
        if !self.connectivity.should_attempt_delivery() {
            return false;
        }
        let Some(payload) = self.queue.next() else {
            return false;
        };

        match self.delivery.deliver_payload(&payload) {
            DeliveryResult::Success => {
                self.queue.remove(payload.timestamp);
                true
            }
            DeliveryResult::Failed {
                can_retry: false, ..
            } => {
                debug!(timestamp = payload.timestamp, "retry payload rejected; dropping");
                self.queue.remove(payload.timestamp);
                false
            }
            DeliveryResult::Failed { can_retry: true, .. } => false,
        }
    }
}

/// Keeps the sampler's server-supplied probability fresh.
pub struct SamplerTask {
    sampler: Arc<ProbabilitySampler>,
    delivery: Arc<dyn Delivery>,
}

impl SamplerTask {
    pub fn new(sampler: Arc<ProbabilitySampler>, delivery: Arc<dyn Delivery>) -> Self {
        Self { sampler, delivery }
    }

    fn refresh_if_expired(&self) {
        if !self.sampler.is_probability_valid() {
            debug!("sampling probability expired; asking the server");
            self.delivery.fetch_current_probability();
        }
    }
}

impl Task for SamplerTask {
    fn on_attach(&mut self, _worker: &WorkerHandle) {
        let callback: Arc<dyn NewProbabilityCallback> = Arc::clone(&self.sampler) as _;
        self.delivery.set_probability_callback(callback);
        self.sampler.restore();
        self.refresh_if_expired();
    }

    fn execute(&mut self) -> bool {
        self.refresh_if_expired();
        false
    }
}
