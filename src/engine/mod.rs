//! # Routing Engine
//!
//! Producer-facing facade over a route. The engine owns the bounded
//! executor, the lifecycle event publisher and the contract monitor, wires
//! a unit of work onto every submission, and satisfies the reply channel of
//! request-reply exchanges with the final output or terminal fault.
//!
//! Submission never blocks the producer: `submit` hands the exchange to a
//! pooled task and returns the correlation id; `request` additionally
//! awaits the reply. Many exchanges are expected to be in flight
//! concurrently, each with its own causal chain — no ordering is implied
//! between unrelated submissions.

use crate::config::EngineConfig;
use crate::constants::properties;
use crate::error::{RelayError, Result};
use crate::events::{EngineEventKind, EventPublisher};
use crate::exchange::{Exchange, ExchangeId, ExchangePattern};
use crate::executor::TaskExecutor;
use crate::step::{run_step, ContractMonitor, Step};
use crate::uow::{Synchronization, UnitOfWork};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub struct Engine {
    route: Arc<dyn Step>,
    executor: TaskExecutor,
    events: EventPublisher,
    monitor: ContractMonitor,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine around a route, bound to the current Tokio runtime.
    pub fn new(route: Arc<dyn Step>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let executor = TaskExecutor::new(config.max_concurrent_tasks)?;
        Ok(Self::with_executor(route, config, executor))
    }

    /// Build an engine sharing an existing executor (several engines may
    /// draw from one pool).
    pub fn with_executor(route: Arc<dyn Step>, config: EngineConfig, executor: TaskExecutor) -> Self {
        let events = EventPublisher::new(config.event_channel_capacity);
        info!(
            route = route.name(),
            max_concurrent = config.max_concurrent_tasks,
            "routing engine ready"
        );
        Self {
            route,
            executor,
            events,
            monitor: ContractMonitor::default(),
            config,
        }
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Contract violations observed anywhere on this engine's routes.
    pub fn monitor(&self) -> &ContractMonitor {
        &self.monitor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fire-and-forget submission. The caller is not blocked; registered
    /// synchronizations (and any added by steps en route) observe the
    /// terminal outcome.
    pub fn submit(&self, exchange: Exchange) -> ExchangeId {
        self.launch(exchange, Vec::new(), None)
    }

    /// Fire-and-forget submission with producer-side completion
    /// synchronizations.
    pub fn submit_with(
        &self,
        exchange: Exchange,
        synchronizations: Vec<Arc<dyn Synchronization>>,
    ) -> ExchangeId {
        self.launch(exchange, synchronizations, None)
    }

    /// Request-reply submission: resolves with the finished exchange on
    /// success, `RelayError::Processing` carrying the terminal fault on
    /// failure, or `RelayError::ContractViolation` if a step lost the
    /// exchange.
    pub async fn request(&self, exchange: Exchange) -> Result<Exchange> {
        if exchange.pattern() != ExchangePattern::InOut {
            return Err(RelayError::Configuration(
                "request requires an InOut exchange".to_string(),
            ));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.launch(exchange, Vec::new(), Some(reply_tx));

        let finished = reply_rx.await.map_err(|_| RelayError::ContractViolation {
            step: self.route.name().to_string(),
            detail: "route finished without producing a reply".to_string(),
        })?;

        match finished.fault() {
            Some(fault) => Err(RelayError::Processing(fault.clone())),
            None => Ok(finished),
        }
    }

    fn launch(
        &self,
        mut exchange: Exchange,
        synchronizations: Vec<Arc<dyn Synchronization>>,
        reply: Option<oneshot::Sender<Exchange>>,
    ) -> ExchangeId {
        exchange.set_contract_monitor(self.monitor.clone());
        exchange.reset_redelivery_state();

        let uow = Arc::new(UnitOfWork::new());
        for synchronization in synchronizations {
            uow.register(synchronization);
        }
        exchange.attach_unit_of_work(Arc::clone(&uow));

        let id = exchange.id();
        self.events.publish(
            EngineEventKind::Submitted,
            id,
            json!({"pattern": exchange.pattern()}),
        );
        debug!(exchange_id = %id, pattern = ?exchange.pattern(), "exchange submitted");

        // deadline watcher: flips the shared cancellation flag, which steps
        // poll at suspension-resumption points
        let watcher = self.config.exchange_timeout_ms.map(|timeout_ms| {
            let flag = exchange.cancellation_flag();
            self.executor.spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                flag.store(true, Ordering::Release);
            })
        });

        let route = Arc::clone(&self.route);
        let events = self.events.clone();
        // the route driver awaits nested steps and must not hold a pool
        // permit while doing so; bounding applies to leaf step work
        self.executor.spawn(async move {
            let outcome = run_step(route.as_ref(), exchange).await;
            if let Some(watcher) = watcher {
                watcher.abort();
            }
            match outcome {
                Ok(finished) => {
                    let success = !finished.is_failed() && !terminated_unrecoverably(&finished);
                    if success {
                        events.publish(EngineEventKind::Completed, finished.id(), json!({}));
                    } else {
                        let fault = finished.fault().map(|f| f.to_string()).unwrap_or_default();
                        events.publish(
                            EngineEventKind::Failed,
                            finished.id(),
                            json!({"error": fault}),
                        );
                    }
                    uow.finish(&finished, success).await;
                    if let Some(reply) = reply {
                        // receiver may have given up waiting; nothing to do
                        let _ = reply.send(finished);
                    }
                }
                Err(e) => {
                    // the exchange is gone; the dropped reply sender (if
                    // any) surfaces the violation to the caller
                    error!(exchange_id = %id, error = %e, "route lost the exchange");
                    events.publish(
                        EngineEventKind::ContractViolation,
                        id,
                        json!({"error": e.to_string()}),
                    );
                }
            }
        });

        id
    }
}

/// A dead-lettered or cancelled exchange is a failure for unit-of-work
/// purposes even when the dead-letter channel handled the fault and the
/// caller sees a normal reply.
fn terminated_unrecoverably(exchange: &Exchange) -> bool {
    exchange
        .property(properties::DEAD_LETTERED)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
        || exchange
            .property(properties::DELIVERY_STATE)
            .and_then(serde_json::Value::as_str)
            == Some("cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Message, ProcessingFault};
    use crate::step::{Done, FnStep, StepFlow};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn engine_with(route: Arc<dyn Step>) -> Engine {
        Engine::new(route, EngineConfig::default()).unwrap()
    }

    struct CaptureOutcome {
        seen: Arc<Mutex<Vec<(ExchangeId, bool)>>>,
    }

    #[async_trait]
    impl Synchronization for CaptureOutcome {
        async fn on_complete(&self, exchange: &Exchange) {
            self.seen.lock().push((exchange.id(), true));
        }
        async fn on_failure(&self, exchange: &Exchange) {
            self.seen.lock().push((exchange.id(), false));
        }
    }

    #[tokio::test]
    async fn test_request_returns_final_output() {
        let route = Arc::new(FnStep::new("shout", |mut ex| {
            let body = ex.message().body.as_str().unwrap_or_default().to_uppercase();
            ex.message_mut().set_body(json!(body));
            ex
        })) as Arc<dyn Step>;
        let engine = engine_with(route);

        let exchange = Exchange::new(ExchangePattern::InOut, Message::new("hello"));
        let reply = engine.request(exchange).await.unwrap();
        assert_eq!(reply.message().body, json!("HELLO"));
    }

    #[tokio::test]
    async fn test_request_surfaces_terminal_fault() {
        let route = Arc::new(FnStep::new("fails", |mut ex| {
            ex.set_fault(ProcessingFault::new("cannot do this").with_source("fails"));
            ex
        })) as Arc<dyn Step>;
        let engine = engine_with(route);

        let exchange = Exchange::new(ExchangePattern::InOut, Message::new("hello"));
        let result = engine.request(exchange).await;
        assert!(matches!(result, Err(RelayError::Processing(_))));
    }

    #[tokio::test]
    async fn test_request_rejects_in_only_exchanges() {
        let engine = engine_with(Arc::new(FnStep::new("ok", |ex| ex)));
        let exchange = Exchange::new(ExchangePattern::InOnly, Message::new(1));
        assert!(matches!(
            engine.request(exchange).await,
            Err(RelayError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_fires_synchronizations_with_outcome() {
        let engine = engine_with(Arc::new(FnStep::new("ok", |ex| ex)));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let exchange = Exchange::new(ExchangePattern::InOnly, Message::new(1));
        let id = engine.submit_with(
            exchange,
            vec![Arc::new(CaptureOutcome { seen: seen.clone() })],
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock(), vec![(id, true)]);
    }

    #[tokio::test]
    async fn test_contract_violation_resolves_request_with_error() {
        struct Vanishes;
        impl Step for Vanishes {
            fn process(&self, exchange: Exchange, done: Done) -> StepFlow {
                drop(exchange);
                drop(done);
                StepFlow::Suspended
            }
            fn name(&self) -> &str {
                "vanishes"
            }
        }

        let engine = engine_with(Arc::new(Vanishes));
        let exchange = Exchange::new(ExchangePattern::InOut, Message::new(1));
        let result = engine.request(exchange).await;

        assert!(matches!(result, Err(RelayError::ContractViolation { .. })));
        assert!(!engine.monitor().is_clean());
    }

    #[tokio::test]
    async fn test_timeout_watcher_cancels_slow_routes() {
        struct Slow;
        impl Step for Slow {
            fn process(&self, exchange: Exchange, done: Done) -> StepFlow {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    done.complete(exchange);
                });
                StepFlow::Suspended
            }
            fn name(&self) -> &str {
                "slow"
            }
        }

        let route = Arc::new(crate::step::pipeline::Pipeline::new(
            "route",
            vec![
                Arc::new(Slow) as Arc<dyn Step>,
                Arc::new(FnStep::new("after", |ex| ex)),
            ],
        )) as Arc<dyn Step>;

        let config = EngineConfig {
            exchange_timeout_ms: Some(20),
            ..EngineConfig::default()
        };
        let engine = Engine::new(route, config).unwrap();

        let exchange = Exchange::new(ExchangePattern::InOut, Message::new(1));
        match engine.request(exchange).await {
            Err(RelayError::Processing(fault)) => {
                assert_eq!(fault.kind, crate::exchange::FaultKind::Cancelled);
            }
            other => panic!("expected cancellation fault, got {other:?}"),
        }
    }
}
