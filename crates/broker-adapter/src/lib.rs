//! At-least-once message dispatch over a pluggable broker driver.
//!
//! The adapter joins a consumer group through a [`broker_driver::Driver`],
//! routes every inbound message to the handler bound to its topic, and takes
//! care of what happens when a handler fails:
//!
//! - Retry: the message is stamped with `x-retry-count`/`x-last-error` and
//!   republished to its own topic after a linear, cancellable backoff
//! - Dead-lettering: once the retry budget is spent the message is copied to
//!   `topic + dlq_suffix` (or an explicit override) with failure context
//! - Dropping: with dead-lettering disabled the message is nacked without
//!   requeue
//!
//! # Example
//!
//! ```rust,no_run
//! use broker_adapter::{handler_fn, Adapter, AdapterConfig, HandlerBinding};
//! use broker_driver::{Message, MemoryDriver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let driver = Arc::new(MemoryDriver::new());
//!     let adapter = Adapter::builder(driver, AdapterConfig::new("billing"))
//!         .binding(
//!             HandlerBinding::new(
//!                 "orders",
//!                 handler_fn(|message: Message| async move {
//!                     println!("{:?}", message.body());
//!                     Ok(())
//!                 }),
//!             )
//!             .max_retries(5),
//!         )
//!         .build()?;
//!
//!     adapter.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     adapter.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod registry;
pub mod retry;

pub use config::{parse_duration, AdapterConfig};
pub use dead_letter::{build_dead_letter, DeadLetterRouter};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{AdapterError, Result};
pub use handler::{handler_fn, FnHandler, Handler};
pub use lifecycle::{Adapter, AdapterBuilder, AdapterState};
pub use registry::{HandlerBinding, Registry, Route};
pub use retry::{RetryDecision, RetryPolicy};
