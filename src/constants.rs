//! # System Constants
//!
//! Well-known exchange property keys and default operational boundaries for
//! the routing engine. Property keys are namespaced under `relay.` so engine
//! metadata never collides with application headers or properties.

/// Exchange property keys written and read by the engine.
///
/// Properties are exchange-scoped metadata, distinct from message headers;
/// steps may read them but should treat the `relay.` namespace as owned by
/// the engine.
pub mod properties {
    /// Number of redeliveries performed for the current submission.
    pub const REDELIVERY_COUNT: &str = "relay.redelivery.count";
    /// Delay in milliseconds that preceded the most recent redelivery.
    pub const REDELIVERY_DELAY_MS: &str = "relay.redelivery.delay_ms";
    /// RFC 3339 timestamp of the most recent delivery attempt.
    pub const REDELIVERY_LAST_ATTEMPT_AT: &str = "relay.redelivery.last_attempt_at";
    /// Current [`DeliveryState`](crate::recovery::DeliveryState), mirrored as a string.
    pub const DELIVERY_STATE: &str = "relay.delivery.state";
    /// Set to `true` once an exchange has been routed to the dead-letter step.
    pub const DEAD_LETTERED: &str = "relay.dead_lettered";
    /// JSON serialization of the fault that exhausted redelivery.
    pub const FAILURE_CAUSE: &str = "relay.failure.cause";
    /// Set to `true` on exchanges suppressed as duplicates.
    pub const DUPLICATE: &str = "relay.duplicate";
    /// Idempotency key resolved for the exchange, when one was extracted.
    pub const IDEMPOTENCY_KEY: &str = "relay.idempotency.key";
    /// Correlation id of the exchange a multicast branch copy was forked from.
    pub const MULTICAST_PARENT: &str = "relay.multicast.parent";
    /// Zero-based branch index of a multicast branch copy.
    pub const MULTICAST_BRANCH: &str = "relay.multicast.branch";
}

/// Default operational limits, shared between `Default` impls and config.
pub mod defaults {
    /// Redeliveries allowed after the initial attempt.
    pub const MAX_REDELIVERIES: u32 = 3;
    /// Delay before the first redelivery.
    pub const INITIAL_DELAY_MS: u64 = 1_000;
    /// Exponential backoff multiplier; 1.0 keeps the delay fixed.
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    /// Upper bound on any computed redelivery delay.
    pub const MAX_DELAY_MS: u64 = 60_000;
    /// Concurrent step executions permitted by the task executor.
    pub const MAX_CONCURRENT_TASKS: usize = 16;
    /// Buffered capacity of the engine event channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;
}
