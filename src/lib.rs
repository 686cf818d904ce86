//! broker-dispatch
//!
//! Runs a [`broker_adapter::Adapter`] from a configuration file: one consumer
//! group, one external command per topic. Each message is piped to its
//! command's stdin; a non-zero exit status counts as a handler failure and
//! goes through the adapter's retry and dead-letter path.
//!
//! # Configuration
//!
//! ```toml
//! driver = "kafka"
//!
//! [adapter]
//! group_id = "billing"
//! max_retries = 5
//! retry_backoff_unit = "2s"
//!
//! [kafka]
//! brokers = "localhost:9092"
//!
//! [[bindings]]
//! topic = "orders"
//! command = ["./bin/handle-order", "--verbose"]
//! timeout = "30s"
//!
//! [[bindings]]
//! topic = "audit"
//! command = ["logger", "-t", "audit"]
//! dlq_enabled = false
//! ```
//!
//! With `driver = "memory"` the broker lives inside the process and starts
//! out with the `[[seed]]` messages from the same file:
//!
//! ```toml
//! driver = "memory"
//!
//! [[seed]]
//! topic = "orders"
//! body = '{"id": 1}'
//! key = "order-1"
//! ```

pub mod command;
pub mod config;

pub use command::CommandHandler;
pub use config::{BindingConfig, DriverKind, FileConfig, SeedMessage};

use anyhow::Context;
use broker_adapter::{Adapter, HandlerBinding};
use broker_driver::{Driver, MemoryDriver, Message};
use broker_kafka_driver::KafkaDriver;
use std::sync::Arc;

/// Create the driver selected by the configuration.
pub fn build_driver(config: &FileConfig) -> Arc<dyn Driver> {
    match config.driver {
        DriverKind::Kafka => Arc::new(KafkaDriver::new(config.kafka_driver_config())),
        DriverKind::Memory => Arc::new(MemoryDriver::new()),
    }
}

/// Publish the configured seed messages through `driver`, connecting it
/// first. Returns how many were published.
pub async fn publish_seed(config: &FileConfig, driver: &dyn Driver) -> anyhow::Result<usize> {
    config.check_seed()?;
    if config.seed.is_empty() {
        return Ok(0);
    }

    driver
        .connect()
        .await
        .context("Failed to connect driver for seeding")?;
    for seed in &config.seed {
        driver
            .publish(&seed.topic, &seed_message(seed))
            .await
            .with_context(|| format!("Failed to seed topic {}", seed.topic))?;
    }
    Ok(config.seed.len())
}

fn seed_message(seed: &SeedMessage) -> Message {
    let mut message = Message::new(&seed.topic, seed.body.clone());
    if let Some(key) = &seed.key {
        message = message.with_key(key.clone());
    }
    for (name, value) in &seed.headers {
        message = message.with_header(name, value);
    }
    message
}

/// Bind every configured topic to its command and build the adapter.
pub fn build_adapter(config: &FileConfig, driver: Arc<dyn Driver>) -> anyhow::Result<Adapter> {
    let bindings = config
        .bindings
        .iter()
        .map(binding_for)
        .collect::<anyhow::Result<Vec<_>>>()?;

    let adapter = Adapter::builder(driver, config.adapter.clone())
        .bindings(bindings)
        .build()?;
    Ok(adapter)
}

fn binding_for(config: &BindingConfig) -> anyhow::Result<HandlerBinding> {
    let handler = CommandHandler::from_config(config)?;
    let mut binding = HandlerBinding::new(&config.topic, handler);
    if let Some(max_retries) = config.max_retries {
        binding = binding.max_retries(max_retries);
    }
    if let Some(dlq_topic) = &config.dlq_topic {
        binding = binding.dlq_topic(dlq_topic);
    }
    if let Some(enabled) = config.dlq_enabled {
        binding = binding.dlq_enabled(enabled);
    }
    Ok(binding)
}
