//! # Step Contract
//!
//! Every routing component implements [`Step`], the non-blocking processing
//! contract: a step either finishes on the caller's task and hands the
//! exchange straight back ([`StepFlow::Completed`]), or it moves the exchange
//! to another execution context (a timer, a pooled task) and promises to fire
//! its [`Done`] handle exactly once from there ([`StepFlow::Suspended`]).
//!
//! The double path lets instant steps skip a scheduling round-trip while
//! slow steps suspend without pinning a thread per in-flight exchange.
//!
//! Composite steps (pipeline, multicast, dead-letter channel, idempotent
//! consumer) are themselves steps, so routes nest by composition.

pub mod multicast;
pub mod pipeline;

use crate::error::{RelayError, Result};
use crate::exchange::Exchange;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

/// Outcome of a [`Step::process`] call.
#[derive(Debug)]
pub enum StepFlow {
    /// The step finished on the caller's task. The completion handle must
    /// not be invoked; the caller proceeds with the returned exchange.
    Completed(Exchange),
    /// The exchange moved to another execution context. The completion
    /// handle will be invoked with it exactly once, after this call returns.
    Suspended,
}

/// The processing contract every routing component implements.
pub trait Step: Send + Sync {
    /// Process the exchange, either inline or by suspending.
    ///
    /// Contract preconditions the engine cannot enforce but relies on:
    /// the completion handle fires exactly once on the suspended path,
    /// never on the completed path, and never before `process` returns.
    /// Violations are detected where possible and recorded on the
    /// exchange's [`ContractMonitor`].
    fn process(&self, exchange: Exchange, done: Done) -> StepFlow;

    /// Name used in logs and fault attribution.
    fn name(&self) -> &str;
}

type DoneFn = Box<dyn FnOnce(Exchange) + Send>;

/// Records completion-contract violations so supervisors can observe them.
///
/// One monitor is shared across an exchange's whole route (branch copies
/// included); the engine exposes its monitor for inspection.
#[derive(Debug, Clone, Default)]
pub struct ContractMonitor {
    inner: Arc<MonitorCounters>,
}

#[derive(Debug, Default)]
struct MonitorCounters {
    double_completions: AtomicU64,
    lost_completions: AtomicU64,
}

impl ContractMonitor {
    /// A completion handle was invoked (or disarmed) after it had already
    /// completed.
    pub(crate) fn record_double_completion(&self) {
        self.inner.double_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// A live completion handle was dropped without ever being invoked.
    pub(crate) fn record_lost_completion(&self) {
        self.inner.lost_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn double_completions(&self) -> u64 {
        self.inner.double_completions.load(Ordering::Relaxed)
    }

    pub fn lost_completions(&self) -> u64 {
        self.inner.lost_completions.load(Ordering::Relaxed)
    }

    /// True when no violation has been observed.
    pub fn is_clean(&self) -> bool {
        self.double_completions() == 0 && self.lost_completions() == 0
    }
}

/// Cloneable completion handle enforcing exactly-once semantics.
///
/// All clones share one underlying slot: whichever clone completes first
/// wins. A second completion is dropped and recorded as a contract
/// violation; dropping the last clone of a still-armed handle records a
/// lost completion.
#[derive(Clone)]
pub struct Done {
    inner: Arc<DoneSlot>,
}

struct DoneSlot {
    callback: Mutex<Option<DoneFn>>,
    monitor: ContractMonitor,
}

impl Done {
    pub fn new(monitor: &ContractMonitor, callback: impl FnOnce(Exchange) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(DoneSlot {
                callback: Mutex::new(Some(Box::new(callback))),
                monitor: monitor.clone(),
            }),
        }
    }

    /// Complete with the finished exchange. Invoking an already-completed
    /// handle is a contract violation: the second exchange is dropped and
    /// the violation recorded.
    pub fn complete(&self, exchange: Exchange) {
        let callback = self.inner.callback.lock().take();
        match callback {
            Some(callback) => callback(exchange),
            None => {
                error!(
                    exchange_id = %exchange.id(),
                    "completion handle invoked twice; dropping second completion"
                );
                self.inner.monitor.record_double_completion();
            }
        }
    }

    /// Disarm after a step returned [`StepFlow::Completed`]. If the slot is
    /// already empty the step completed the handle *and* returned inline,
    /// which is the re-entrant form of double completion.
    pub(crate) fn disarm(&self) {
        if self.inner.callback.lock().take().is_none() {
            error!("step completed inline after invoking its completion handle");
            self.inner.monitor.record_double_completion();
        }
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let armed = self.inner.callback.lock().is_some();
        f.debug_struct("Done").field("armed", &armed).finish()
    }
}

impl Drop for DoneSlot {
    fn drop(&mut self) {
        if self.callback.get_mut().is_some() {
            error!("completion handle dropped without being invoked; exchange lost");
            self.monitor.record_lost_completion();
        }
    }
}

/// Drive a step to completion from async code, bridging both contract paths.
///
/// Surfaces a vanished completion (handle dropped, exchange lost) as
/// [`RelayError::ContractViolation`] instead of hanging forever.
pub async fn run_step(step: &dyn Step, exchange: Exchange) -> Result<Exchange> {
    let monitor = exchange.contract_monitor().clone();
    let (tx, rx) = oneshot::channel();
    let done = Done::new(&monitor, move |ex| {
        // receiver gone means the caller was dropped mid-await; nothing to do
        let _ = tx.send(ex);
    });

    match step.process(exchange, done.clone()) {
        StepFlow::Completed(ex) => {
            done.disarm();
            Ok(ex)
        }
        StepFlow::Suspended => {
            // release our clone: if the step drops its handles without
            // completing, the slot (and the sender inside it) must go too,
            // or this await would never resolve
            drop(done);
            rx.await.map_err(|_| RelayError::ContractViolation {
                step: step.name().to_string(),
                detail: "completion handle dropped without being invoked".to_string(),
            })
        }
    }
}

/// Adapter turning a plain function into a synchronous step.
///
/// The function receives the exchange and returns it, mutated; faults are
/// attached via [`Exchange::set_fault`]. Always takes the completed path.
pub struct FnStep {
    name: String,
    func: Arc<dyn Fn(Exchange) -> Exchange + Send + Sync>,
}

impl FnStep {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(Exchange) -> Exchange + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl Step for FnStep {
    fn process(&self, exchange: Exchange, _done: Done) -> StepFlow {
        StepFlow::Completed((self.func)(exchange))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
