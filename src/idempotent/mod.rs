//! # Idempotent Store
//!
//! Deduplication ledger keyed by caller-supplied identifiers. An entry moves
//! through two states: present-unconfirmed ("being processed") and
//! present-confirmed ("durably processed"); absence means never seen.
//! `add` must be a single atomic test-and-set so that exactly one of N
//! concurrent callers racing on a key wins.
//!
//! Store failures are their own error kind: a store that cannot answer does
//! not decide duplicate status — the call site chooses fail-open or
//! fail-closed (see [`IdempotentConsumer::fail_open`]).

mod consumer;
mod memory;

pub use consumer::IdempotentConsumer;
pub use memory::MemoryIdempotentStore;

use async_trait::async_trait;

/// Errors from the backing store, distinct from processing faults.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("idempotent store unavailable: {0}")]
    Unavailable(String),
    #[error("idempotent store operation failed: {0}")]
    Backend(String),
}

/// Keyed ledger preventing duplicate processing.
///
/// Backings range from an in-memory map to an external cache; the only hard
/// requirement is that [`add`](IdempotentStore::add) is atomic against
/// concurrent callers.
#[async_trait]
pub trait IdempotentStore: Send + Sync {
    /// Atomically insert `key` if absent. Returns `true` iff this call
    /// performed the insertion — the caller is the first to see the key.
    async fn add(&self, key: &str) -> Result<bool, StoreError>;

    /// Non-mutating membership check.
    async fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete the entry, returning whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Transition an existing unconfirmed entry to confirmed. Returns
    /// `false` if the entry is missing or already confirmed: confirmation
    /// only ever follows a successful `add`.
    async fn confirm(&self, key: &str) -> Result<bool, StoreError>;

    /// Empty the store.
    async fn clear(&self) -> Result<(), StoreError>;
}
