//! Driver contract for broker-dispatch.
//!
//! A driver is the only piece that speaks a broker's wire protocol. The
//! dispatch layer in `broker-adapter` talks to brokers exclusively through the
//! [`Driver`] trait defined here, which keeps retry, backoff and dead-letter
//! handling independent of the broker technology.
//!
//! This crate provides:
//! - [`Message`] - the unit flowing through the pipeline
//! - [`Driver`] - connect, publish, consume as a group, ack/nack, ping
//! - [`headers`] - header names stamped by the dispatch layer
//! - [`MemoryDriver`] - an in-process driver for local runs and tests

pub mod driver;
pub mod error;
pub mod headers;
pub mod memory;
pub mod message;

pub use driver::{
    is_cancellation, settle, Cancelled, ConsumeContext, Driver, MessageCallback, Settlement,
};
pub use error::{DriverError, Result};
pub use memory::MemoryDriver;
pub use message::{Message, UNASSIGNED_OFFSET, UNASSIGNED_PARTITION};
