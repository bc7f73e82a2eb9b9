//! # perfspan Demo
//!
//! Drives a full pipeline from several producer threads and prints what
//! happened to the spans.
//!
//! ## Features Demonstrated
//!
//! - Nested spans parented through the per-thread context stack
//! - Network spans and custom attributes
//! - A span held back by a condition until related work finishes
//! - End callbacks that veto spans
//! - Retryable delivery failures landing in the on-disk retry queue and
//!   being replayed
//!
//! By default spans go to a simulated backend that fails a fraction of
//! requests. Pass `--endpoint` to post them to a real collector instead.
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (2 producers, 20 spans each)
//! cargo run -p perfspan-http --bin demo --release -- --quick
//!
//! # Simulated backend failing 30% of requests
//! cargo run -p perfspan-http --bin demo -- --failure-rate 0.3
//!
//! # Real endpoint
//! cargo run -p perfspan-http --bin demo -- --endpoint https://otlp.example.com/v1/traces --api-key KEY
//!
//! # More logging
//! RUST_LOG=perfspan=debug cargo run -p perfspan-http --bin demo
//! ```

use perfspan::{
    Attributes, Delivery, DeliveryResult, Pipeline, PipelineConfig, ResponseClass, Span,
    SpanOptions, TracePayload,
};
use perfspan_http::HttpDelivery;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

// =============================================================================
// SIMULATED BACKEND
// =============================================================================

/// A backend that fails a fraction of requests with a retryable status.
struct SimulatedBackend {
    failure_rate: f64,
    attempts: AtomicU64,
    spans_accepted: AtomicU64,
    payloads_replayed: AtomicU64,
}

impl SimulatedBackend {
    fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate,
            attempts: AtomicU64::new(0),
            spans_accepted: AtomicU64::new(0),
            payloads_replayed: AtomicU64::new(0),
        }
    }

    fn respond(&self, payload: &TracePayload) -> DeliveryResult {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(rand::thread_rng().gen_range(1..10)));
        if rand::thread_rng().gen_bool(self.failure_rate) {
            ResponseClass::from_status(503).into_result(payload)
        } else {
            DeliveryResult::Success
        }
    }
}

impl Delivery for SimulatedBackend {
    fn deliver_spans(&self, spans: &[Arc<Span>], resource: &Attributes) -> DeliveryResult {
        let payload = match perfspan::PayloadEncoder::new("demo").encode(spans, resource) {
            Ok(payload) => payload,
            Err(_) => {
                return DeliveryResult::Failed {
                    payload: None,
                    can_retry: false,
                }
            }
        };
        let result = self.respond(&payload);
        if result.is_success() {
            self.spans_accepted
                .fetch_add(spans.len() as u64, Ordering::Relaxed);
        }
        result
    }

    fn deliver_payload(&self, payload: &TracePayload) -> DeliveryResult {
        let result = self.respond(payload);
        if result.is_success() {
            self.payloads_replayed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn fetch_current_probability(&self) {}

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

struct Args {
    producers: usize,
    spans_per_producer: usize,
    failure_rate: f64,
    endpoint: Option<String>,
    api_key: String,
}

fn parse_args() -> Args {
    let mut args = Args {
        producers: 4,
        spans_per_producer: 100,
        failure_rate: 0.2,
        endpoint: None,
        api_key: "demo-api-key".to_owned(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--quick" => {
                args.producers = 2;
                args.spans_per_producer = 20;
            }
            "--failure-rate" => {
                if let Some(rate) = iter.next().and_then(|v| v.parse::<f64>().ok()) {
                    args.failure_rate = rate.clamp(0.0, 1.0);
                }
            }
            "--endpoint" => args.endpoint = iter.next(),
            "--api-key" => {
                if let Some(key) = iter.next() {
                    args.api_key = key;
                }
            }
            other => eprintln!("ignoring unknown argument {other}"),
        }
    }
    args
}

// =============================================================================
// WORKLOAD
// =============================================================================

fn produce(pipeline: &Pipeline, producer: usize, spans: usize) {
    let factory = pipeline.span_factory();
    for i in 0..spans {
        let request = factory.create_span(format!("handle-request-{producer}"), SpanOptions::default());
        request.set_attribute("producer", producer as i64);
        request.set_attribute("request.index", i as i64);

        // Parented to `request` through the context stack
        let network = factory.create_network_span(
            "https://api.example.com/catalog",
            "GET",
            SpanOptions::default(),
        );
        thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(50..500)));
        network.set_attribute("http.status_code", 200);
        network.end();

        if i % 10 == 0 {
            let internal = factory.create_span("internal-debug", SpanOptions::default());
            internal.end();
        }
        request.end();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    let dir = std::env::temp_dir().join(format!("perfspan-demo-{}", std::process::id()));
    let config = PipelineConfig::development(args.api_key.clone())
        .with_service_name("perfspan-demo")
        .with_app_version(env!("CARGO_PKG_VERSION"))
        .with_persistence_dir(&dir)
        .with_worker_sleep(Duration::from_millis(200))
        .with_batch_size_trigger(50);

    let backend = Arc::new(SimulatedBackend::new(args.failure_rate));
    let pipeline = match &args.endpoint {
        Some(endpoint) => {
            let config = config.with_endpoint(endpoint.clone());
            let delivery = match HttpDelivery::from_config(&config) {
                Ok(delivery) => delivery,
                Err(e) => {
                    eprintln!("could not create HTTP delivery: {e}");
                    std::process::exit(1);
                }
            };
            Pipeline::start(config, delivery)
        }
        None => Pipeline::start(config, Arc::clone(&backend)),
    };
    let pipeline = match pipeline {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            eprintln!("could not start pipeline: {e}");
            std::process::exit(1);
        }
    };

    // Internal debugging spans never leave the process
    pipeline.add_on_end_callback(Arc::new(|span: &Span| span.name() != "internal-debug"));

    info!(
        producers = args.producers,
        spans_per_producer = args.spans_per_producer,
        failure_rate = args.failure_rate,
        "starting demo"
    );
    let started = Instant::now();

    // A screen load that stays open until its data arrives
    let factory = pipeline.span_factory();
    let screen = factory.create_view_load_span("Activity", "CatalogScreen", SpanOptions::default().make_context(false));
    let data_loaded = screen.block(Duration::from_secs(5));
    screen.end();

    let handles: Vec<_> = (0..args.producers)
        .map(|producer| {
            let pipeline = Arc::clone(&pipeline);
            let spans = args.spans_per_producer;
            thread::spawn(move || produce(&pipeline, producer, spans))
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            eprintln!("producer thread panicked");
        }
    }

    if let Some(condition) = data_loaded {
        condition.upgrade();
        condition.close();
    }

    // Let the worker drain the batch and work through the retry queue
    for _ in 0..20 {
        pipeline.flush();
        thread::sleep(Duration::from_millis(250));
        if pipeline.tracer().pending() == 0 && pipeline.retry_queue().is_empty() {
            break;
        }
    }
    let elapsed = started.elapsed();

    let metrics = pipeline.tracer().metrics();
    println!();
    println!("=== perfspan demo ===");
    println!("elapsed:             {elapsed:?}");
    println!("spans ended:         {}", metrics.spans_ended());
    println!("spans batched:       {}", metrics.spans_batched());
    println!("spans sampled out:   {}", metrics.spans_sampled_out());
    println!("spans rejected:      {}", metrics.spans_rejected());
    if args.endpoint.is_none() {
        println!("delivery attempts:   {}", backend.attempts.load(Ordering::Relaxed));
        println!("spans accepted:      {}", backend.spans_accepted.load(Ordering::Relaxed));
        println!("payloads replayed:   {}", backend.payloads_replayed.load(Ordering::Relaxed));
    }
    println!("retry queue left:    {}", pipeline.retry_queue().len());

    pipeline.shutdown();
    if let Err(e) = pipeline.persistence().clear() {
        eprintln!("could not clean up {}: {e}", dir.display());
    }
    let _ = std::fs::remove_dir_all(&dir);
}
