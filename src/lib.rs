#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Relay Core Rust
//!
//! High-performance Rust core for asynchronous message routing and error
//! recovery: move a unit of work (an *exchange*) through a composed route of
//! processing steps without dedicating a thread to each in-flight exchange.
//!
//! ## Overview
//!
//! Every routing component implements one contract ([`Step`]): finish
//! inline, or suspend by handing the exchange to another execution context
//! and firing a completion handle exactly once. Composite steps are
//! themselves steps, so routes nest by composition:
//!
//! - [`Pipeline`] runs steps strictly in sequence and fails fast.
//! - [`Multicast`] fans an exchange out to independent branch copies,
//!   sequentially or on the bounded executor, and merges results through a
//!   pluggable [`AggregationStrategy`] in branch order.
//! - [`DeadLetterChannel`] retries failed steps under a
//!   [`RedeliveryPolicy`] — timer-scheduled, never blocking — and routes
//!   exhausted exchanges to a dead-letter step.
//! - [`IdempotentConsumer`] suppresses duplicates against an
//!   [`IdempotentStore`], confirming keys only on terminal success.
//!
//! The [`Engine`] is the producer-facing facade: fire-and-forget or
//! request-reply submission, a [`UnitOfWork`] per submission firing
//! completion synchronizations exactly once, lifecycle events over a
//! broadcast channel, and per-exchange timeout cancellation.
//!
//! ## Module Organization
//!
//! - [`exchange`] - the exchange data model: messages, properties, faults
//! - [`step`] - the processing contract, pipeline and multicast
//! - [`recovery`] - redelivery policy, delivery states, dead-letter channel
//! - [`idempotent`] - deduplication store and consumer
//! - [`uow`] - unit-of-work completion synchronizations
//! - [`engine`] - producer facade
//! - [`executor`] - bounded task executor
//! - [`events`] - lifecycle event publisher
//! - [`config`] - layered file/environment configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_core::{Engine, EngineConfig, Exchange, ExchangePattern, FnStep, Message};
//! use std::sync::Arc;
//!
//! # async fn example() -> relay_core::Result<()> {
//! let route = Arc::new(FnStep::new("uppercase", |mut ex| {
//!     let body = ex.message().body.as_str().unwrap_or_default().to_uppercase();
//!     ex.message_mut().set_body(serde_json::json!(body));
//!     ex
//! }));
//!
//! let engine = Engine::new(route, EngineConfig::default())?;
//! let reply = engine
//!     .request(Exchange::new(ExchangePattern::InOut, Message::new("hello")))
//!     .await?;
//! assert_eq!(reply.message().body, serde_json::json!("HELLO"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod executor;
pub mod idempotent;
pub mod logging;
pub mod recovery;
pub mod step;
pub mod uow;

pub use config::{EngineConfig, MulticastConfig, RedeliveryConfig};
pub use engine::Engine;
pub use error::{RelayError, Result};
pub use events::{EngineEvent, EngineEventKind, EventPublisher};
pub use exchange::{
    Exchange, ExchangeId, ExchangePattern, FaultKind, Headers, Message, ProcessingFault,
};
pub use executor::TaskExecutor;
pub use idempotent::{IdempotentConsumer, IdempotentStore, MemoryIdempotentStore, StoreError};
pub use logging::init_structured_logging;
pub use recovery::{
    error_handled_pipeline, DeadLetterChannel, DeliveryState, RedeliveryPolicy,
};
pub use step::multicast::{AggregationStrategy, BodyCollect, Multicast, UseLatest};
pub use step::pipeline::Pipeline;
pub use step::{run_step, ContractMonitor, Done, FnStep, Step, StepFlow};
pub use uow::{IdempotentCompletion, Synchronization, UnitOfWork};
