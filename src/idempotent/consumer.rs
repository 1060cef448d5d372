//! Deduplicating step wrapper around the idempotent store.

use super::{IdempotentStore, StoreError};
use crate::constants::properties;
use crate::events::{EngineEventKind, EventPublisher};
use crate::exchange::{Exchange, ProcessingFault};
use crate::executor::TaskExecutor;
use crate::step::{run_step, Done, Step, StepFlow};
use crate::uow::IdempotentCompletion;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

type KeyExtractor = Arc<dyn Fn(&Exchange) -> Option<String> + Send + Sync>;

/// Wraps an inner step with deduplication against an idempotent store.
///
/// The key is extracted from the exchange before processing and `add`ed to
/// the store; duplicates are marked and skipped without running the inner
/// step. First-seen exchanges run the inner step, and the entry is settled
/// from the exchange's terminal outcome: confirmed on success, removed or
/// left unconfirmed on failure per [`IdempotentConsumer::remove_on_failure`].
pub struct IdempotentConsumer {
    name: String,
    store: Arc<dyn IdempotentStore>,
    inner: Arc<dyn Step>,
    key_of: KeyExtractor,
    executor: TaskExecutor,
    remove_on_failure: bool,
    fail_open: bool,
    events: Option<EventPublisher>,
}

impl IdempotentConsumer {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn IdempotentStore>,
        inner: Arc<dyn Step>,
        key_of: impl Fn(&Exchange) -> Option<String> + Send + Sync + 'static,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            inner,
            key_of: Arc::new(key_of),
            executor,
            remove_on_failure: true,
            fail_open: false,
            events: None,
        }
    }

    /// Convenience constructor keying on a message header.
    pub fn from_header(
        name: impl Into<String>,
        store: Arc<dyn IdempotentStore>,
        inner: Arc<dyn Step>,
        header: impl Into<String>,
        executor: TaskExecutor,
    ) -> Self {
        let header = header.into();
        Self::new(
            name,
            store,
            inner,
            move |ex: &Exchange| {
                ex.message().header(&header).map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            },
            executor,
        )
    }

    /// On failure, remove the unconfirmed entry so the key can be retried
    /// by a fresh submission (default), or leave it when `false`.
    pub fn remove_on_failure(mut self, remove: bool) -> Self {
        self.remove_on_failure = remove;
        self
    }

    /// When the store cannot answer, process anyway (`true`, sacrificing
    /// dedup) or fail the exchange (`false`, default).
    pub fn fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    fn guard(&self) -> Guard {
        Guard {
            name: self.name.clone(),
            store: Arc::clone(&self.store),
            inner: Arc::clone(&self.inner),
            key_of: Arc::clone(&self.key_of),
            remove_on_failure: self.remove_on_failure,
            fail_open: self.fail_open,
            events: self.events.clone(),
        }
    }
}

impl Step for IdempotentConsumer {
    fn process(&self, exchange: Exchange, done: Done) -> StepFlow {
        let guard = self.guard();
        self.executor
            .spawn(async move { guard.run(exchange, done).await });
        StepFlow::Suspended
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct Guard {
    name: String,
    store: Arc<dyn IdempotentStore>,
    inner: Arc<dyn Step>,
    key_of: KeyExtractor,
    remove_on_failure: bool,
    fail_open: bool,
    events: Option<EventPublisher>,
}

impl Guard {
    async fn run(self, mut exchange: Exchange, done: Done) {
        let key = match (self.key_of)(&exchange) {
            Some(key) if !key.is_empty() => key,
            _ => {
                exchange.set_fault(
                    ProcessingFault::new("no idempotency key on exchange")
                        .with_source(&self.name)
                        .permanent(),
                );
                done.complete(exchange);
                return;
            }
        };
        exchange.set_property(properties::IDEMPOTENCY_KEY, key.clone());

        match self.store.add(&key).await {
            Ok(true) => self.process_first_seen(exchange, key, done).await,
            Ok(false) => {
                debug!(consumer = %self.name, key = %key, "duplicate exchange suppressed");
                exchange.set_property(properties::DUPLICATE, true);
                if let Some(events) = &self.events {
                    events.publish(
                        EngineEventKind::DuplicateSuppressed,
                        exchange.id(),
                        json!({"key": key}),
                    );
                }
                done.complete(exchange);
            }
            Err(e) => self.handle_store_error(exchange, e, done).await,
        }
    }

    async fn process_first_seen(self, exchange: Exchange, key: String, done: Done) {
        if let Some(uow) = exchange.unit_of_work() {
            // the entry settles with the submission's terminal outcome,
            // after any redelivery has run its course
            uow.register(Arc::new(IdempotentCompletion::new(
                Arc::clone(&self.store),
                key,
                self.remove_on_failure,
            )));
            match run_step(self.inner.as_ref(), exchange).await {
                Ok(ex) => done.complete(ex),
                Err(e) => {
                    // the exchange is lost; leave the unconfirmed entry, the
                    // outcome of the partially-executed step is unknown
                    warn!(consumer = %self.name, error = %e, "inner step lost the exchange");
                    drop(done);
                }
            }
            return;
        }

        // no unit of work (nested usage): settle the entry inline
        match run_step(self.inner.as_ref(), exchange).await {
            Ok(ex) => {
                let settled = if ex.is_failed() {
                    if self.remove_on_failure {
                        self.store.remove(&key).await.map(|_| ())
                    } else {
                        Ok(())
                    }
                } else {
                    self.store.confirm(&key).await.map(|_| ())
                };
                if let Err(e) = settled {
                    warn!(consumer = %self.name, key = %key, error = %e, "failed to settle idempotent entry");
                }
                done.complete(ex);
            }
            Err(e) => {
                warn!(consumer = %self.name, error = %e, "inner step lost the exchange");
                drop(done);
            }
        }
    }

    async fn handle_store_error(self, mut exchange: Exchange, error: StoreError, done: Done) {
        if self.fail_open {
            warn!(
                consumer = %self.name,
                error = %error,
                "store unavailable, processing without dedup"
            );
            match run_step(self.inner.as_ref(), exchange).await {
                Ok(ex) => done.complete(ex),
                Err(e) => {
                    warn!(consumer = %self.name, error = %e, "inner step lost the exchange");
                    drop(done);
                }
            }
        } else {
            exchange.set_fault(
                ProcessingFault::store(error.to_string()).with_source(&self.name),
            );
            done.complete(exchange);
        }
    }
}
