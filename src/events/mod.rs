//! # Engine Lifecycle Events
//!
//! Broadcast publisher for routing lifecycle events. Subscribers are
//! optional: publishing with nobody listening is not an error, and slow
//! subscribers lag rather than block the engine.

use crate::exchange::ExchangeId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// What happened to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventKind {
    /// An exchange entered the engine.
    Submitted,
    /// The route finished without a fault.
    Completed,
    /// The route terminated with a fault still attached.
    Failed,
    /// A redelivery was scheduled after a step failure.
    RedeliveryScheduled,
    /// Redelivery was exhausted and the exchange routed to the dead-letter
    /// step.
    DeadLettered,
    /// The exchange was suppressed as a duplicate.
    DuplicateSuppressed,
    /// The exchange was cancelled before reaching a terminal outcome.
    Cancelled,
    /// A step broke the completion contract.
    ContractViolation,
}

/// A published lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub kind: EngineEventKind,
    pub exchange_id: ExchangeId,
    /// Event-specific context (attempt counts, delays, fault summaries).
    pub detail: Value,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

/// High-throughput lifecycle event publisher.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    /// Create a publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Succeeds regardless of subscriber count.
    pub fn publish(&self, kind: EngineEventKind, exchange_id: ExchangeId, detail: Value) {
        let event = EngineEvent {
            kind,
            exchange_id,
            detail,
            published_at: chrono::Utc::now(),
        };
        // send() errs only when there are no subscribers; events are
        // best-effort observability, so that is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::defaults::EVENT_CHANNEL_CAPACITY)
    }
}
