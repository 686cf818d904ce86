//! Kafka driver for broker-dispatch.
//!
//! Implements [`broker_driver::Driver`] on top of `rdkafka`: a shared
//! `FutureProducer` for publishing and a `StreamConsumer` per consumer group
//! session. Message headers travel as Kafka record headers, so the retry
//! count survives a republish.

pub mod config;
pub mod convert;
pub mod driver;

pub use config::KafkaDriverConfig;
pub use driver::KafkaDriver;
