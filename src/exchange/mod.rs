//! # Exchange Model
//!
//! The unit-of-work token that flows through a route. An exchange carries an
//! input message, an optional output message produced by processing, a set of
//! engine-scoped properties, at most one outstanding fault, and a shared
//! cancellation flag a supervising watcher can set.
//!
//! Exchanges move by value through steps: exactly one owner at any moment,
//! transferred at each step boundary. Multicast never shares an exchange
//! between branches; each branch receives an independent copy via
//! [`Exchange::fork_for_branch`].

mod message;

pub use message::{Headers, Message};

use crate::constants::properties;
use crate::step::ContractMonitor;
use crate::uow::UnitOfWork;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Process-unique correlation id, generated at exchange creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message exchange pattern, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// Fire-and-forget: no reply channel needs to be satisfied.
    InOnly,
    /// Request-reply: the producer expects the final output message or fault.
    InOut,
}

/// Broad classification of a fault attached to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// A step failed to produce a result.
    Processing,
    /// The exchange was cancelled by a supervisor or timeout watcher.
    Cancelled,
    /// An idempotent store operation failed mid-route.
    Store,
}

/// The failure-slot payload: what went wrong, where, and whether retrying
/// could ever succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingFault {
    pub kind: FaultKind,
    pub message: String,
    /// Name of the step that set the fault, when known.
    pub source_step: Option<String>,
    /// Permanent faults are excluded from redelivery by default.
    pub permanent: bool,
    pub occurred_at: DateTime<Utc>,
}

impl ProcessingFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Processing,
            message: message.into(),
            source_step: None,
            permanent: false,
            occurred_at: Utc::now(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Cancelled,
            // cancellation is never worth retrying
            permanent: true,
            ..Self::new(message)
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Store,
            ..Self::new(message)
        }
    }

    pub fn with_source(mut self, step: impl Into<String>) -> Self {
        self.source_step = Some(step.into());
        self
    }

    /// Mark the fault permanent: redelivery will not be attempted.
    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

impl fmt::Display for ProcessingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source_step {
            Some(step) => write!(f, "{:?} fault in step '{}': {}", self.kind, step, self.message),
            None => write!(f, "{:?} fault: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProcessingFault {}

/// The unit-of-work data carrier flowing through the engine.
///
/// Not `Clone`: an exchange has exactly one owner. Multicast branch copies
/// are made explicitly with [`Exchange::fork_for_branch`].
#[derive(Debug)]
pub struct Exchange {
    id: ExchangeId,
    pattern: ExchangePattern,
    input: Message,
    output: Option<Message>,
    properties: HashMap<String, Value>,
    fault: Option<ProcessingFault>,
    cancelled: Arc<AtomicBool>,
    monitor: ContractMonitor,
    unit_of_work: Option<Arc<UnitOfWork>>,
    created_at: DateTime<Utc>,
}

impl Exchange {
    /// Create a new exchange around an input message.
    pub fn new(pattern: ExchangePattern, input: Message) -> Self {
        Self {
            id: ExchangeId::new(),
            pattern,
            input,
            output: None,
            properties: HashMap::new(),
            fault: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            monitor: ContractMonitor::default(),
            unit_of_work: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut Message {
        &mut self.input
    }

    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    pub fn set_output(&mut self, message: Message) {
        self.output = Some(message);
    }

    /// The current message: the output if processing has produced one, the
    /// input otherwise.
    pub fn message(&self) -> &Message {
        self.output.as_ref().unwrap_or(&self.input)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        self.output.as_mut().unwrap_or(&mut self.input)
    }

    /// Fold the output message (if any) into the input, readying the
    /// exchange for the next step of a pipeline.
    pub fn prepare_next(&mut self) {
        if let Some(out) = self.output.take() {
            self.input = out;
        }
    }

    /// Replace the input with a snapshot and discard any output, so a
    /// redelivery sees the message the failed attempt started from.
    pub fn restore_input(&mut self, message: Message) {
        self.input = message;
        self.output = None;
    }

    // --- properties ---------------------------------------------------

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    // --- failure slot -------------------------------------------------

    pub fn fault(&self) -> Option<&ProcessingFault> {
        self.fault.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.fault.is_some()
    }

    /// Attach a fault, marking the exchange failed. At most one fault is
    /// outstanding; a later fault replaces an earlier one.
    pub fn set_fault(&mut self, fault: ProcessingFault) {
        self.fault = Some(fault);
    }

    /// Clear the failure slot, returning the exchange to in-flight.
    pub fn clear_fault(&mut self) -> Option<ProcessingFault> {
        self.fault.take()
    }

    // --- cancellation -------------------------------------------------

    /// Request cancellation. Steps poll this at suspension-resumption
    /// points; a pending redelivery is aborted once set.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Shared handle to the cancellation flag, for timeout watchers.
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    // --- redelivery bookkeeping ---------------------------------------

    /// Redeliveries performed for the current submission (0 until the
    /// first retry).
    pub fn redelivery_count(&self) -> u32 {
        self.properties
            .get(properties::REDELIVERY_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Record one redelivery: bump the counter and stamp the attempt
    /// metadata used by observers.
    pub fn record_redelivery(&mut self, delay_ms: u64) {
        let next = u64::from(self.redelivery_count()) + 1;
        self.set_property(properties::REDELIVERY_COUNT, next);
        self.set_property(properties::REDELIVERY_DELAY_MS, delay_ms);
        self.set_property(
            properties::REDELIVERY_LAST_ATTEMPT_AT,
            Utc::now().to_rfc3339(),
        );
    }

    /// Reset redelivery state for a fresh submission. Retry metadata never
    /// carries across unrelated submissions.
    pub fn reset_redelivery_state(&mut self) {
        self.properties.remove(properties::REDELIVERY_COUNT);
        self.properties.remove(properties::REDELIVERY_DELAY_MS);
        self.properties.remove(properties::REDELIVERY_LAST_ATTEMPT_AT);
    }

    // --- engine wiring ------------------------------------------------

    pub(crate) fn contract_monitor(&self) -> &ContractMonitor {
        &self.monitor
    }

    pub(crate) fn set_contract_monitor(&mut self, monitor: ContractMonitor) {
        self.monitor = monitor;
    }

    pub fn unit_of_work(&self) -> Option<&Arc<UnitOfWork>> {
        self.unit_of_work.as_ref()
    }

    pub(crate) fn attach_unit_of_work(&mut self, uow: Arc<UnitOfWork>) {
        self.unit_of_work = Some(uow);
    }

    // --- multicast ----------------------------------------------------

    /// Derive an independent copy for a multicast branch: deep copy of the
    /// current message and properties, fresh correlation id, shared
    /// cancellation flag. The copy does not own the parent's unit of work.
    pub fn fork_for_branch(&self, branch: usize) -> Exchange {
        let mut copy = Exchange {
            id: ExchangeId::new(),
            pattern: self.pattern,
            input: self.message().clone(),
            output: None,
            properties: self.properties.clone(),
            fault: None,
            cancelled: Arc::clone(&self.cancelled),
            monitor: self.monitor.clone(),
            unit_of_work: None,
            created_at: Utc::now(),
        };
        copy.set_property(properties::MULTICAST_PARENT, self.id.to_string());
        copy.set_property(properties::MULTICAST_BRANCH, branch as u64);
        copy
    }
}
