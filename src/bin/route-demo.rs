//! Demo route: dedup, fan-out enrichment and bounded redelivery end to end.
//!
//! Run with `RUST_LOG=debug cargo run --bin route-demo` to watch the engine
//! decide. The flaky pricing step fails on its first attempt per exchange,
//! so redelivery and (for the duplicate submission) dedup both trigger.

use anyhow::Result;
use relay_core::{
    BodyCollect, DeadLetterChannel, Engine, EngineConfig, EngineEvent, Exchange, ExchangePattern,
    FnStep, IdempotentConsumer, MemoryIdempotentStore, Message, Multicast, Pipeline,
    RedeliveryPolicy, Step, TaskExecutor,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    relay_core::init_structured_logging();

    let config = EngineConfig::load()?;
    config.validate()?;
    let executor = TaskExecutor::new(config.max_concurrent_tasks)?;

    // branches enriching an order from different angles
    let stock = Arc::new(FnStep::new("stock", |mut ex| {
        ex.message_mut().set_body(json!({"stock": "reserved"}));
        ex
    })) as Arc<dyn Step>;
    let shipping = Arc::new(FnStep::new("shipping", |mut ex| {
        ex.message_mut().set_body(json!({"carrier": "northwind"}));
        ex
    })) as Arc<dyn Step>;

    // pricing fails the first time it sees each order
    let attempts: Arc<parking_lot::Mutex<HashMap<String, u32>>> = Arc::default();
    let pricing = Arc::new(FnStep::new("pricing", move |mut ex| {
        let order = ex
            .message()
            .header("order-id")
            .and_then(|v| v.as_str())
            .unwrap_or("?")
            .to_string();
        let mut seen = attempts.lock();
        let n = seen.entry(order).or_insert(0);
        *n += 1;
        if *n == 1 {
            ex.set_fault(
                relay_core::ProcessingFault::new("pricing service timed out")
                    .with_source("pricing"),
            );
        } else {
            ex.message_mut().set_body(json!({"total": 41.5}));
        }
        ex
    })) as Arc<dyn Step>;

    let enrich = Arc::new(
        Multicast::new("enrich", vec![stock, shipping], executor.clone())
            .with_strategy(Arc::new(BodyCollect))
            .parallel(config.multicast.parallel)
            .ordered(config.multicast.ordered)
            .stop_on_failure(config.multicast.stop_on_failure),
    ) as Arc<dyn Step>;

    let dead_letter = Arc::new(FnStep::new("dead-letter", |ex| {
        eprintln!("dead-lettered exchange {}", ex.id());
        ex
    })) as Arc<dyn Step>;

    let policy = RedeliveryPolicy::from_config(&config.redelivery);
    let priced = Arc::new(DeadLetterChannel::new(
        "pricing-channel",
        pricing,
        dead_letter,
        policy,
        executor.clone(),
    )) as Arc<dyn Step>;

    let store = Arc::new(MemoryIdempotentStore::new());
    let pipeline = Arc::new(Pipeline::new("order-route", vec![enrich, priced])) as Arc<dyn Step>;
    let route = Arc::new(IdempotentConsumer::from_header(
        "order-dedup",
        store,
        pipeline,
        "order-id",
        executor.clone(),
    )) as Arc<dyn Step>;

    let engine = Engine::with_executor(route, config, executor);

    let mut events = engine.events().subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(EngineEvent {
            kind,
            exchange_id,
            detail,
            ..
        }) = events.recv().await
        {
            println!("event {kind:?} exchange={exchange_id} detail={detail}");
        }
    });

    // request-reply: first sighting of order 1001, recovers via redelivery
    let order = Message::new(json!({"sku": "ROPE-12"})).with_header("order-id", "1001");
    let reply = engine
        .request(Exchange::new(ExchangePattern::InOut, order.clone()))
        .await?;
    println!("reply: {}", reply.message().body);

    // fire-and-forget duplicate of the same order: suppressed by dedup
    engine.submit(Exchange::new(ExchangePattern::InOnly, order));

    tokio::time::sleep(Duration::from_millis(200)).await;
    watcher.abort();
    Ok(())
}
