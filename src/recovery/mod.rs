//! # Error Recovery
//!
//! Bounded redelivery with a dead-letter fallback. A failed delivery
//! attempt moves the exchange through a small per-submission state machine:
//!
//! ```text
//! InFlight ──fault──▶ Evaluating ──allowed──▶ Scheduled ──timer──▶ InFlight
//!                          │
//!                          ├─exhausted/excluded──▶ DeadLettered (terminal)
//!                          └─cancelled───────────▶ Cancelled    (terminal)
//! InFlight ──no fault──▶ Completed (terminal)
//! ```
//!
//! Faults are recovered locally, up to the policy's attempt budget; past it
//! they surface through dead-letter routing and unit-of-work failure
//! signals, never by re-throwing into unrelated in-flight exchanges.

mod dead_letter;
mod policy;
mod states;

pub use dead_letter::DeadLetterChannel;
pub use policy::RedeliveryPolicy;
pub use states::DeliveryState;

use crate::executor::TaskExecutor;
use crate::step::pipeline::Pipeline;
use crate::step::Step;
use std::sync::Arc;

/// Build a pipeline whose steps are each wrapped in their own dead-letter
/// channel, so a retry resumes at the step that failed rather than the
/// route's start.
pub fn error_handled_pipeline(
    name: impl Into<String>,
    steps: Vec<Arc<dyn Step>>,
    dead_letter: Arc<dyn Step>,
    policy: RedeliveryPolicy,
    executor: TaskExecutor,
) -> Pipeline {
    let name = name.into();
    let wrapped = steps
        .into_iter()
        .enumerate()
        .map(|(index, step)| {
            Arc::new(DeadLetterChannel::new(
                format!("{name}:channel[{index}]"),
                step,
                Arc::clone(&dead_letter),
                policy.clone(),
                executor.clone(),
            )) as Arc<dyn Step>
        })
        .collect();
    Pipeline::new(name, wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Exchange, ExchangePattern, Message, ProcessingFault};
    use crate::step::{run_step, FnStep};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retry_resumes_at_failed_step_not_route_start() {
        let executor = TaskExecutor::new(4).unwrap();
        let first_runs = Arc::new(AtomicUsize::new(0));
        let second_runs = Arc::new(AtomicUsize::new(0));

        let first_counter = first_runs.clone();
        let first = Arc::new(FnStep::new("first", move |ex| {
            first_counter.fetch_add(1, Ordering::SeqCst);
            ex
        })) as Arc<dyn Step>;

        let second_counter = second_runs.clone();
        let second = Arc::new(FnStep::new("second", move |mut ex| {
            // fail on the first two visits, succeed after
            if second_counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ex.set_fault(ProcessingFault::new("not yet").with_source("second"));
            } else {
                ex.message_mut().set_body(json!("done"));
            }
            ex
        })) as Arc<dyn Step>;

        let pipeline = error_handled_pipeline(
            "route",
            vec![first, second],
            Arc::new(FnStep::new("dead", |ex| ex)),
            RedeliveryPolicy::new(3, Duration::from_millis(1)),
            executor,
        );

        let exchange = Exchange::new(ExchangePattern::InOnly, Message::new("go"));
        let result = run_step(&pipeline, exchange).await.unwrap();

        assert!(!result.is_failed());
        assert_eq!(result.message().body, json!("done"));
        assert_eq!(first_runs.load(Ordering::SeqCst), 1, "first step runs once");
        assert_eq!(second_runs.load(Ordering::SeqCst), 3);
    }
}
