//! Property test for the completion contract: over pipelines of randomized
//! step implementations — any mix of inline and suspended completion, with
//! random timer delays — every step runs exactly once and the pipeline's
//! own completion fires exactly once, with no recorded contract violation.

use proptest::prelude::*;
use relay_core::{run_step, Done, Exchange, ExchangePattern, Message, Pipeline, Step, StepFlow};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A step that completes inline or from a spawned task, per configuration.
struct ConfiguredStep {
    name: String,
    suspend: bool,
    delay_ms: u64,
    invocations: Arc<AtomicUsize>,
}

impl Step for ConfiguredStep {
    fn process(&self, mut exchange: Exchange, done: Done) -> StepFlow {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let marker = self.name.clone();
        if self.suspend {
            let delay = Duration::from_millis(self.delay_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                exchange.set_property(marker, true);
                done.complete(exchange);
            });
            StepFlow::Suspended
        } else {
            exchange.set_property(marker, true);
            StepFlow::Completed(exchange)
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn exactly_once_completion_over_random_step_mixes(
        modes in prop::collection::vec((any::<bool>(), 0u64..4), 1..8)
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let mut counters = Vec::new();
            let mut steps: Vec<Arc<dyn Step>> = Vec::new();
            for (index, (suspend, delay_ms)) in modes.iter().enumerate() {
                let invocations = Arc::new(AtomicUsize::new(0));
                counters.push(invocations.clone());
                steps.push(Arc::new(ConfiguredStep {
                    name: format!("step-{index}"),
                    suspend: *suspend,
                    delay_ms: *delay_ms,
                    invocations,
                }));
            }

            let total = steps.len();
            let pipeline = Pipeline::new("random", steps);
            let exchange = Exchange::new(ExchangePattern::InOnly, Message::new("x"));
            let submitted_id = exchange.id();

            // run_step resolves exactly once; a dropped or doubled
            // completion would surface as an error or a hang
            let finished = run_step(&pipeline, exchange).await.unwrap();
            assert_eq!(finished.id(), submitted_id);

            // every step ran exactly once and stamped the exchange
            for (index, invocations) in counters.iter().enumerate() {
                assert_eq!(invocations.load(Ordering::SeqCst), 1, "step {index} invocations");
                assert_eq!(
                    finished.property(&format!("step-{index}")),
                    Some(&serde_json::json!(true)),
                    "step {index} stamp"
                );
            }
            assert_eq!(counters.len(), total);
        });
    }
}
