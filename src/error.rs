//! # Structured Error Handling
//!
//! Top-level error type for the routing engine. Processing faults travel on
//! the exchange itself (see [`ProcessingFault`](crate::exchange::ProcessingFault));
//! `RelayError` covers the failures that are surfaced to callers directly:
//! broken completion contracts, store unavailability and configuration
//! problems.

use crate::exchange::ProcessingFault;
use crate::idempotent::StoreError;

/// Errors surfaced by the engine to producers and supervisors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A route terminated with a fault still attached to the exchange.
    #[error("processing failed: {0}")]
    Processing(ProcessingFault),

    /// A step broke the completion contract (double completion, or a
    /// completion handle dropped without ever being invoked). The affected
    /// exchange cannot be recovered and its route cannot be safely retried.
    #[error("completion contract violated by step '{step}': {detail}")]
    ContractViolation { step: String, detail: String },

    /// The idempotent store could not determine duplicate status.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid engine or policy configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The task executor has no runtime to schedule work on.
    #[error("executor unavailable: {0}")]
    Executor(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
