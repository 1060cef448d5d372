//! # Unit of Work
//!
//! Completion bookkeeping for one top-level exchange submission. Interested
//! parties register [`Synchronization`]s while the exchange is in flight;
//! when the route reaches a terminal outcome the engine fires them in
//! registration order, each exactly once, with either the success or the
//! failure signal — never both.

use crate::exchange::Exchange;
use crate::idempotent::IdempotentStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Callback interested in the terminal outcome of an exchange.
#[async_trait]
pub trait Synchronization: Send + Sync {
    /// The route completed without a fault.
    async fn on_complete(&self, _exchange: &Exchange) {}

    /// The route terminated unrecoverably (dead-lettered, cancelled).
    async fn on_failure(&self, _exchange: &Exchange) {}
}

/// Ordered synchronization list with exactly-once firing.
#[derive(Default)]
pub struct UnitOfWork {
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    fired: AtomicBool,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronization. Order of registration is the order of
    /// firing.
    pub fn register(&self, synchronization: Arc<dyn Synchronization>) {
        self.synchronizations.lock().push(synchronization);
    }

    pub fn len(&self) -> usize {
        self.synchronizations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.synchronizations.lock().is_empty()
    }

    /// Fire all registered synchronizations with the given outcome. A
    /// second call is a no-op: each synchronization sees exactly one
    /// signal.
    pub async fn finish(&self, exchange: &Exchange, success: bool) {
        if self.fired.swap(true, Ordering::AcqRel) {
            warn!(exchange_id = %exchange.id(), "unit of work already finished, ignoring");
            return;
        }

        // snapshot so no guard is held across await points
        let synchronizations: Vec<_> = self.synchronizations.lock().clone();
        debug!(
            exchange_id = %exchange.id(),
            success,
            count = synchronizations.len(),
            "firing completion synchronizations"
        );
        for synchronization in synchronizations {
            if success {
                synchronization.on_complete(exchange).await;
            } else {
                synchronization.on_failure(exchange).await;
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("synchronizations", &self.len())
            .field("fired", &self.is_finished())
            .finish()
    }
}

/// Settles an idempotent store entry from the exchange outcome: confirm on
/// success; on failure either remove the unconfirmed entry (allowing a
/// fresh submission to retry the key) or leave it, per policy.
pub struct IdempotentCompletion {
    store: Arc<dyn IdempotentStore>,
    key: String,
    remove_on_failure: bool,
}

impl IdempotentCompletion {
    pub fn new(store: Arc<dyn IdempotentStore>, key: impl Into<String>, remove_on_failure: bool) -> Self {
        Self {
            store,
            key: key.into(),
            remove_on_failure,
        }
    }
}

#[async_trait]
impl Synchronization for IdempotentCompletion {
    async fn on_complete(&self, exchange: &Exchange) {
        if let Err(e) = self.store.confirm(&self.key).await {
            warn!(
                exchange_id = %exchange.id(),
                key = %self.key,
                error = %e,
                "failed to confirm idempotent entry"
            );
        }
    }

    async fn on_failure(&self, exchange: &Exchange) {
        if !self.remove_on_failure {
            return;
        }
        if let Err(e) = self.store.remove(&self.key).await {
            warn!(
                exchange_id = %exchange.id(),
                key = %self.key,
                error = %e,
                "failed to remove idempotent entry after failure"
            );
        }
    }
}
