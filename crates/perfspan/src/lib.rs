//! perfspan - span lifecycle and delivery engine
//!
//! The in-process core of a performance monitoring SDK. Any number of
//! application threads create, annotate and end spans; a single background
//! worker batches, samples, encodes and delivers them, keeping undelivered
//! payloads on disk until they can be retried.
//!
//! # Key Features
//!
//! - Lock-free span end path (atomic state machine + intrusive Treiber stack)
//! - Per-thread span context stack for implicit parenting
//! - Deterministic trace-id sampling with a server-driven probability
//! - Conditions that hold an ended span back until related work finishes
//! - Crash-safe retry queue (newest payload first)
//! - Prioritized span start/end callbacks and install-then-start plugins
//!
//! # Example
//!
//! ```no_run
//! use perfspan::{NullDelivery, Pipeline, PipelineConfig, SpanOptions};
//!
//! let pipeline = Pipeline::start(
//!     PipelineConfig::development("your-api-key").with_persistence_dir("/tmp/perfspan"),
//!     NullDelivery,
//! )?;
//!
//! let factory = pipeline.span_factory();
//! let span = factory.create_span("load-catalog", SpanOptions::default());
//! span.set_attribute("catalog.items", 42);
//! span.end();
//!
//! pipeline.flush();
//! # Ok::<(), std::io::Error>(())
//! ```

mod backoff;
mod invariants;

pub mod attributes;
pub mod clock;
pub mod collector;
pub mod condition;
pub mod config;
pub mod context;
pub mod delivery;
pub mod device_id;
pub mod error;
pub mod factory;
pub mod payload;
pub mod persistence;
pub mod pipeline;
pub mod plugin;
pub mod prioritized;
pub mod processor;
pub mod sampler;
pub mod span;
pub mod tasks;
pub mod tracker;
pub mod worker;

// Re-export main types
pub use attributes::{AttributeLimits, AttributeValue, Attributes};
pub use collector::BatchingCollector;
pub use condition::{Condition, TimeoutExecutor};
pub use config::PipelineConfig;
pub use delivery::{
    AlwaysConnected, Connectivity, ConnectivityFlag, Delivery, DeliveryResult, NullDelivery,
    ResponseClass, RetryDelivery,
};
pub use device_id::DeviceIdFilePersistence;
pub use error::{EncodeError, PersistenceError};
pub use factory::{OnSpanStartCallback, SpanFactory, SpanOptions};
pub use payload::{PayloadEncoder, TracePayload};
pub use persistence::{Persistence, PersistentState, RetryQueue};
pub use pipeline::Pipeline;
pub use plugin::{Plugin, PluginContext, PluginManager, PluginTable};
pub use prioritized::{Prioritized, PrioritizedSet, HIGH_PRIORITY, LOW_PRIORITY, NORM_PRIORITY};
pub use processor::{
    NoopSpanProcessor, OnSpanEndCallback, SpanProcessor, Tracer, TracerConfig, TracerMetrics,
};
pub use sampler::{DiscardingSampler, NewProbabilityCallback, ProbabilitySampler, Sampler};
pub use span::{Span, SpanCategory, SpanContext, SpanKind, SpanMetrics};
pub use tracker::SpanTracker;
pub use worker::{Task, Worker, WorkerHandle};
