//! Dead-letter channel: bounded redelivery around a single step, with a
//! dead-letter destination for exchanges that exhaust their attempts.
//!
//! The channel wraps one inner step, so a retry re-runs exactly the step
//! that failed. Composing a route as a pipeline of channel-wrapped steps
//! (see [`error_handled_pipeline`](super::error_handled_pipeline)) therefore
//! resubmits at the point of failure, never from the route's start.
//!
//! Retries are scheduled on a timer task — the thread that detected the
//! failure is never blocked waiting out a delay.

use super::{DeliveryState, RedeliveryPolicy};
use crate::constants::properties;
use crate::events::{EngineEventKind, EventPublisher};
use crate::exchange::{Exchange, Message, ProcessingFault};
use crate::executor::TaskExecutor;
use crate::step::{run_step, Done, Step, StepFlow};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct DeadLetterChannel {
    name: String,
    step: Arc<dyn Step>,
    dead_letter: Arc<dyn Step>,
    policy: RedeliveryPolicy,
    executor: TaskExecutor,
    handled: bool,
    events: Option<EventPublisher>,
}

impl DeadLetterChannel {
    pub fn new(
        name: impl Into<String>,
        step: Arc<dyn Step>,
        dead_letter: Arc<dyn Step>,
        policy: RedeliveryPolicy,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            step,
            dead_letter,
            policy,
            executor,
            handled: true,
            events: None,
        }
    }

    /// Whether dead-lettering clears the fault so the caller sees the
    /// dead-letter outcome as handled (default), or leaves it attached.
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    fn settle_context(&self, baseline: Message) -> Settle {
        Settle {
            name: self.name.clone(),
            step: Arc::clone(&self.step),
            dead_letter: Arc::clone(&self.dead_letter),
            policy: self.policy.clone(),
            handled: self.handled,
            events: self.events.clone(),
            baseline,
        }
    }
}

impl Step for DeadLetterChannel {
    fn process(&self, mut exchange: Exchange, done: Done) -> StepFlow {
        set_delivery_state(&mut exchange, DeliveryState::InFlight);

        // redeliveries re-run the step against the message the first
        // attempt started from, not a half-mutated one
        let baseline = exchange.input().clone();

        let settle = self.settle_context(baseline.clone());
        let continuation = {
            let executor = self.executor.clone();
            let done = done.clone();
            Done::new(exchange.contract_monitor(), move |ex| {
                // first attempt finished on another execution context
                executor.spawn(async move { settle.run(ex, done).await });
            })
        };

        match self.step.process(exchange, continuation.clone()) {
            StepFlow::Completed(mut ex) => {
                continuation.disarm();
                if !ex.is_failed() {
                    set_delivery_state(&mut ex, DeliveryState::Completed);
                    return StepFlow::Completed(ex);
                }
                // failure handling is asynchronous from here on
                let settle = self.settle_context(baseline);
                self.executor.spawn(async move { settle.run(ex, done).await });
                StepFlow::Suspended
            }
            StepFlow::Suspended => StepFlow::Suspended,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Per-submission recovery loop, running on its own task.
struct Settle {
    name: String,
    step: Arc<dyn Step>,
    dead_letter: Arc<dyn Step>,
    policy: RedeliveryPolicy,
    handled: bool,
    events: Option<EventPublisher>,
    /// Input message as it entered the channel, restored before each retry.
    baseline: Message,
}

impl Settle {
    async fn run(self, mut exchange: Exchange, done: Done) {
        loop {
            let fault = match exchange.fault().cloned() {
                None => {
                    set_delivery_state(&mut exchange, DeliveryState::Completed);
                    done.complete(exchange);
                    return;
                }
                Some(fault) => fault,
            };

            set_delivery_state(&mut exchange, DeliveryState::Evaluating);
            if exchange.is_cancelled() {
                self.cancel(exchange, fault, done);
                return;
            }

            let redeliveries = exchange.redelivery_count();
            if !self.policy.should_redeliver(redeliveries, &fault) {
                self.route_to_dead_letter(exchange, fault, redeliveries, done)
                    .await;
                return;
            }

            let upcoming = redeliveries + 1;
            let delay = self.policy.delay_for(upcoming);
            set_delivery_state(&mut exchange, DeliveryState::Scheduled);
            debug!(
                channel = %self.name,
                exchange_id = %exchange.id(),
                redelivery = upcoming,
                delay_ms = delay.as_millis() as u64,
                error = %fault,
                "scheduling redelivery"
            );
            if let Some(events) = &self.events {
                events.publish(
                    EngineEventKind::RedeliveryScheduled,
                    exchange.id(),
                    json!({"redelivery": upcoming, "delay_ms": delay.as_millis() as u64}),
                );
            }

            tokio::time::sleep(delay).await;

            if exchange.is_cancelled() {
                self.cancel(exchange, fault, done);
                return;
            }

            exchange.clear_fault();
            exchange.restore_input(self.baseline.clone());
            exchange.record_redelivery(delay.as_millis() as u64);
            set_delivery_state(&mut exchange, DeliveryState::InFlight);

            match run_step(self.step.as_ref(), exchange).await {
                Ok(ex) => exchange = ex,
                Err(e) => {
                    error!(channel = %self.name, error = %e, "redelivered step lost the exchange");
                    drop(done);
                    return;
                }
            }
        }
    }

    /// Cancellation aborts any pending redelivery: no further attempts, no
    /// dead-letter routing, a distinct terminal state.
    fn cancel(&self, mut exchange: Exchange, fault: ProcessingFault, done: Done) {
        set_delivery_state(&mut exchange, DeliveryState::Cancelled);
        if let Ok(cause) = serde_json::to_value(&fault) {
            exchange.set_property(properties::FAILURE_CAUSE, cause);
        }
        exchange.set_fault(
            ProcessingFault::cancelled("cancelled while awaiting redelivery")
                .with_source(&self.name),
        );
        warn!(channel = %self.name, exchange_id = %exchange.id(), "redelivery aborted by cancellation");
        if let Some(events) = &self.events {
            events.publish(EngineEventKind::Cancelled, exchange.id(), json!({}));
        }
        done.complete(exchange);
    }

    async fn route_to_dead_letter(
        &self,
        mut exchange: Exchange,
        fault: ProcessingFault,
        redeliveries: u32,
        done: Done,
    ) {
        set_delivery_state(&mut exchange, DeliveryState::DeadLettered);
        exchange.set_property(properties::DEAD_LETTERED, true);
        if let Ok(cause) = serde_json::to_value(&fault) {
            exchange.set_property(properties::FAILURE_CAUSE, cause);
        }
        warn!(
            channel = %self.name,
            exchange_id = %exchange.id(),
            redeliveries,
            error = %fault,
            "redelivery exhausted, routing to dead letter"
        );
        if let Some(events) = &self.events {
            events.publish(
                EngineEventKind::DeadLettered,
                exchange.id(),
                json!({"redeliveries": redeliveries, "error": fault.message}),
            );
        }

        match run_step(self.dead_letter.as_ref(), exchange).await {
            Ok(mut ex) => {
                if self.handled {
                    ex.clear_fault();
                } else if !ex.is_failed() {
                    // the caller must still see the original fault
                    ex.set_fault(fault);
                }
                done.complete(ex);
            }
            Err(e) => {
                error!(channel = %self.name, error = %e, "dead letter step lost the exchange");
                drop(done);
            }
        }
    }
}

fn set_delivery_state(exchange: &mut Exchange, state: DeliveryState) {
    exchange.set_property(properties::DELIVERY_STATE, state.to_string());
}
