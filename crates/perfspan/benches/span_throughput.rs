use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use perfspan::{
    AttributeLimits, BatchingCollector, ProbabilitySampler, SpanFactory, SpanOptions,
    SpanProcessor, Tracer, TracerConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SPANS_PER_PRODUCER: u64 = 10_000;

fn tracer() -> Arc<Tracer> {
    Arc::new(Tracer::new(
        Arc::new(ProbabilitySampler::fixed(1.0)),
        TracerConfig {
            batch_size_trigger: usize::MAX,
            batch_timeout: Duration::from_secs(3600),
        },
    ))
}

fn factory(tracer: &Arc<Tracer>) -> SpanFactory {
    SpanFactory::new(
        Arc::clone(tracer) as Arc<dyn SpanProcessor>,
        AttributeLimits::default(),
    )
}

fn bench_single_thread_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_end");
    group.throughput(Throughput::Elements(SPANS_PER_PRODUCER));

    group.bench_function("create_attribute_end", |b| {
        let tracer = tracer();
        let factory = factory(&tracer);
        b.iter(|| {
            for i in 0..SPANS_PER_PRODUCER {
                let span = factory.create_span("bench", SpanOptions::default().make_context(false));
                span.set_attribute("iteration", i as i64);
                span.end();
            }
            black_box(tracer.pending());
            tracer.force_current_batch();
            black_box(tracer.collect_next_batch());
        });
    });

    group.finish();
}

fn bench_concurrent_end(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_end_concurrent");

    for producers in [2usize, 4, 8] {
        group.throughput(Throughput::Elements(SPANS_PER_PRODUCER * producers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{producers}P")),
            &producers,
            |b, &n| {
                b.iter(|| {
                    let tracer = tracer();
                    let handles: Vec<_> = (0..n)
                        .map(|_| {
                            let factory = factory(&tracer);
                            thread::spawn(move || {
                                for _ in 0..SPANS_PER_PRODUCER {
                                    factory
                                        .create_span("bench", SpanOptions::default())
                                        .end();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }
                    tracer.force_current_batch();
                    let batch = tracer.collect_next_batch().unwrap();
                    assert_eq!(batch.len() as u64, SPANS_PER_PRODUCER * n as u64);
                });
            },
        );
    }

    group.finish();
}

fn bench_collector_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("collector");
    group.throughput(Throughput::Elements(SPANS_PER_PRODUCER));

    let noop = SpanFactory::new(
        Arc::new(perfspan::NoopSpanProcessor),
        AttributeLimits::default(),
    );
    group.bench_function("add_take_batch", |b| {
        b.iter_with_setup(
            || {
                (0..SPANS_PER_PRODUCER)
                    .map(|_| noop.create_span("bench", SpanOptions::default().make_context(false)))
                    .collect::<Vec<_>>()
            },
            |spans| {
                let collector = BatchingCollector::new();
                for span in spans {
                    collector.add(span);
                }
                black_box(collector.take_batch());
            },
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_single_thread_end,
    bench_concurrent_end,
    bench_collector_take
);
criterion_main!(benches);
