//! Fan-out of one exchange to N branch steps plus result aggregation.
//!
//! Each branch receives an independent copy of the exchange (deep-copied
//! message and properties, shared cancellation flag); only the aggregator
//! ever touches the original. Branches run either sequentially in declared
//! order or concurrently on the bounded executor. Either way the
//! aggregation strategy is invoked from a single logical thread of control
//! — the coordinator task serializes merges — so strategies need no
//! internal locking.
//!
//! In parallel mode completions arrive in any order, but merges happen in
//! original branch order by default: out-of-order results wait in a buffer
//! until their predecessors have been merged. Order-insensitive strategies
//! can opt into completion-order merging with [`Multicast::ordered`].

use super::{run_step, Done, Step, StepFlow};
use crate::error::RelayError;
use crate::exchange::{Exchange, ProcessingFault};
use crate::executor::TaskExecutor;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pluggable merge function combining branch results into one answer.
pub trait AggregationStrategy: Send + Sync {
    /// Merge a branch result into the accumulated answer. `accumulated` is
    /// `None` for the first merge.
    fn aggregate(&self, accumulated: Option<Exchange>, branch: Exchange) -> Exchange;
}

/// Keeps the most recently merged branch result as the answer.
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, _accumulated: Option<Exchange>, branch: Exchange) -> Exchange {
        branch
    }
}

/// Collects every branch's message body into a JSON array, in merge order.
pub struct BodyCollect;

impl AggregationStrategy for BodyCollect {
    fn aggregate(&self, accumulated: Option<Exchange>, branch: Exchange) -> Exchange {
        match accumulated {
            None => {
                let mut ex = branch;
                let first = ex.message().body.clone();
                ex.message_mut().set_body(json!([first]));
                ex
            }
            Some(mut acc) => {
                let mut bodies = acc.message().body.as_array().cloned().unwrap_or_default();
                bodies.push(branch.message().body.clone());
                acc.message_mut().set_body(json!(bodies));
                acc
            }
        }
    }
}

pub struct Multicast {
    name: String,
    branches: Arc<Vec<Arc<dyn Step>>>,
    strategy: Arc<dyn AggregationStrategy>,
    executor: TaskExecutor,
    parallel: bool,
    ordered: bool,
    stop_on_failure: bool,
}

impl Multicast {
    pub fn new(
        name: impl Into<String>,
        branches: Vec<Arc<dyn Step>>,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            branches: Arc::new(branches),
            strategy: Arc::new(UseLatest),
            executor,
            parallel: false,
            ordered: true,
            stop_on_failure: true,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn AggregationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Submit branches concurrently to the executor instead of one at a
    /// time.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Merge in original branch order (default) or, when `false`, in
    /// completion order — only sound for order-insensitive strategies.
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Stop scheduling not-yet-started branches once one fails (default).
    /// When `false`, failed branch results are merged like any other.
    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Per-submission snapshot handed to the coordinator task.
    fn fanout(&self) -> Fanout {
        Fanout {
            name: self.name.clone(),
            branches: Arc::clone(&self.branches),
            strategy: Arc::clone(&self.strategy),
            executor: self.executor.clone(),
            ordered: self.ordered,
            stop_on_failure: self.stop_on_failure,
        }
    }
}

impl Step for Multicast {
    fn process(&self, exchange: Exchange, done: Done) -> StepFlow {
        if self.branches.is_empty() {
            return StepFlow::Completed(exchange);
        }

        let fanout = self.fanout();
        if self.parallel {
            self.executor
                .spawn(async move { fanout.coordinate_parallel(exchange, done).await });
        } else {
            self.executor
                .spawn(async move { fanout.coordinate_sequential(exchange, done).await });
        }
        StepFlow::Suspended
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Fanout {
    name: String,
    branches: Arc<Vec<Arc<dyn Step>>>,
    strategy: Arc<dyn AggregationStrategy>,
    executor: TaskExecutor,
    ordered: bool,
    stop_on_failure: bool,
}

impl Fanout {
    async fn coordinate_sequential(self, mut original: Exchange, done: Done) {
        let mut accumulated: Option<Exchange> = None;

        for (index, branch) in self.branches.iter().enumerate() {
            if original.is_cancelled() {
                original.set_fault(
                    ProcessingFault::cancelled("multicast cancelled before branch")
                        .with_source(&self.name),
                );
                done.complete(original);
                return;
            }

            // branches are serialized here, so they run on the coordinator
            // without drawing pool permits; a permit held across a nested
            // fan-out could starve the pool
            let copy = original.fork_for_branch(index);
            let result = run_step(branch.as_ref(), copy).await;

            match result {
                Ok(ex) if ex.is_failed() && self.stop_on_failure => {
                    let fault = ex
                        .fault()
                        .cloned()
                        .unwrap_or_else(|| ProcessingFault::new("branch failed"));
                    debug!(
                        multicast = %self.name,
                        branch = index,
                        "branch failed, skipping remaining branches"
                    );
                    original.set_fault(fault);
                    done.complete(original);
                    return;
                }
                Ok(ex) => {
                    accumulated = Some(self.strategy.aggregate(accumulated.take(), ex));
                }
                Err(e) => {
                    warn!(multicast = %self.name, branch = index, error = %e, "branch lost");
                    original.set_fault(ProcessingFault::new(e.to_string()).with_source(&self.name));
                    done.complete(original);
                    return;
                }
            }
        }

        self.finish(original, accumulated, done);
    }

    async fn coordinate_parallel(self, mut original: Exchange, done: Done) {
        let total = self.branches.len();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel::<(usize, Result<Exchange, RelayError>)>(total);

        for (index, branch) in self.branches.iter().enumerate() {
            let copy = original.fork_for_branch(index);
            let branch = Arc::clone(branch);
            let stop = Arc::clone(&stop);
            let tx = tx.clone();
            self.executor.spawn_bounded(async move {
                // a failed sibling stops branches that have not started yet
                if stop.load(Ordering::Acquire) {
                    return;
                }
                let result = run_step(branch.as_ref(), copy).await;
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut pending: BTreeMap<usize, Exchange> = BTreeMap::new();
        let mut next_to_merge = 0usize;
        let mut accumulated: Option<Exchange> = None;
        let mut failure: Option<ProcessingFault> = None;

        while let Some((index, result)) = rx.recv().await {
            if failure.is_some() {
                // drain without merging; in-flight siblings finish unmerged
                continue;
            }
            match result {
                Ok(ex) if ex.is_failed() && self.stop_on_failure => {
                    stop.store(true, Ordering::Release);
                    failure = Some(
                        ex.fault()
                            .cloned()
                            .unwrap_or_else(|| ProcessingFault::new("branch failed")),
                    );
                }
                Ok(ex) => {
                    if self.ordered {
                        pending.insert(index, ex);
                        while let Some(ready) = pending.remove(&next_to_merge) {
                            accumulated = Some(self.strategy.aggregate(accumulated.take(), ready));
                            next_to_merge += 1;
                        }
                    } else {
                        accumulated = Some(self.strategy.aggregate(accumulated.take(), ex));
                    }
                }
                Err(e) => {
                    warn!(multicast = %self.name, branch = index, error = %e, "branch lost");
                    stop.store(true, Ordering::Release);
                    failure = Some(ProcessingFault::new(e.to_string()).with_source(&self.name));
                }
            }
        }

        match failure {
            Some(fault) => {
                original.set_fault(fault);
                done.complete(original);
            }
            None => self.finish(original, accumulated, done),
        }
    }

    /// Fold the aggregated answer back into the original exchange and
    /// complete the multicast's own handle.
    fn finish(&self, mut original: Exchange, accumulated: Option<Exchange>, done: Done) {
        if let Some(answer) = accumulated {
            original.set_output(answer.message().clone());
        }
        debug!(multicast = %self.name, exchange_id = %original.id(), "multicast complete");
        done.complete(original);
    }
}
