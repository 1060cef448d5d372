//! Sequential step composition with fail-fast semantics.
//!
//! Steps run strictly one after another; the output message of each step
//! becomes the input of the next. A fault stops the pipeline immediately and
//! later steps never see the exchange. The pipeline preserves its caller's
//! contract: it completes inline while steps complete inline, and when a
//! step suspends, its continuation resumes the remaining steps and fires the
//! pipeline's own completion handle only after the last one.

use super::{Done, Step, StepFlow};
use crate::exchange::{Exchange, ProcessingFault};
use std::sync::Arc;
use tracing::debug;

pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                name: name.into(),
                steps,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.steps.is_empty()
    }
}

impl Step for Pipeline {
    fn process(&self, exchange: Exchange, done: Done) -> StepFlow {
        PipelineInner::run_from(Arc::clone(&self.inner), exchange, 0, done)
    }

    fn name(&self) -> &str {
        &self.inner.name
    }
}

impl PipelineInner {
    /// Trampoline over the steps starting at `index`. Runs steps inline for
    /// as long as they complete synchronously; the first suspension hands
    /// the rest of the walk to the continuation.
    fn run_from(
        this: Arc<Self>,
        mut exchange: Exchange,
        mut index: usize,
        done: Done,
    ) -> StepFlow {
        loop {
            if exchange.is_failed() {
                debug!(
                    pipeline = %this.name,
                    step_index = index,
                    exchange_id = %exchange.id(),
                    "pipeline stopping on fault"
                );
                return StepFlow::Completed(exchange);
            }
            if index >= this.steps.len() {
                return StepFlow::Completed(exchange);
            }
            if exchange.is_cancelled() {
                exchange.set_fault(
                    ProcessingFault::cancelled("exchange cancelled between pipeline steps")
                        .with_source(&this.name),
                );
                return StepFlow::Completed(exchange);
            }
            if index > 0 {
                exchange.prepare_next();
            }

            let step = Arc::clone(&this.steps[index]);
            let next = index + 1;
            let continuation = {
                let this = Arc::clone(&this);
                let done = done.clone();
                Done::new(exchange.contract_monitor(), move |ex| {
                    Self::resume(this, ex, next, done);
                })
            };

            match step.process(exchange, continuation.clone()) {
                StepFlow::Completed(ex) => {
                    continuation.disarm();
                    exchange = ex;
                    index = next;
                }
                StepFlow::Suspended => return StepFlow::Suspended,
            }
        }
    }

    /// Continuation entry point: a suspended step finished, keep walking
    /// and complete the pipeline's own handle when the walk ends inline.
    fn resume(this: Arc<Self>, exchange: Exchange, index: usize, done: Done) {
        match Self::run_from(this, exchange, index, done.clone()) {
            StepFlow::Completed(ex) => done.complete(ex),
            StepFlow::Suspended => {}
        }
    }
}
