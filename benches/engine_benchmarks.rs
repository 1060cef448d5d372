use criterion::{black_box, criterion_group, criterion_main, Criterion};
use relay_core::{run_step, Exchange, ExchangePattern, FnStep, Message, Pipeline, Step};
use std::sync::Arc;

fn benchmark_exchange_creation(c: &mut Criterion) {
    c.bench_function("exchange_creation", |b| {
        b.iter(|| {
            Exchange::new(
                ExchangePattern::InOnly,
                Message::new(black_box("payload")).with_header("key", "value"),
            )
        })
    });
}

fn benchmark_pipeline_sync_path(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let steps: Vec<Arc<dyn Step>> = (0..8)
        .map(|i| {
            Arc::new(FnStep::new(format!("step-{i}"), |mut ex| {
                ex.message_mut().set_header("hop", true);
                ex
            })) as Arc<dyn Step>
        })
        .collect();
    let pipeline = Pipeline::new("bench", steps);

    c.bench_function("pipeline_8_sync_steps", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let exchange = Exchange::new(ExchangePattern::InOnly, Message::new("x"));
                run_step(&pipeline, exchange).await.unwrap()
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_exchange_creation,
    benchmark_pipeline_sync_path
);
criterion_main!(benches);
