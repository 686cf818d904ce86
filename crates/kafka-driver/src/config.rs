use rdkafka::config::ClientConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the Kafka driver
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KafkaDriverConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Session timeout in milliseconds
    pub session_timeout_ms: u64,
    /// Auto offset reset strategy ("earliest" or "latest")
    ///
    /// "earliest" means a group without committed offsets starts from the
    /// beginning of each topic, so nothing published before the first start
    /// is skipped.
    pub auto_offset_reset: String,
    /// Let the client commit stored offsets periodically
    ///
    /// Offsets are only stored after the dispatch callback succeeds, so
    /// auto-commit never commits a message that has not been handled.
    pub enable_auto_commit: bool,
    /// Producer delivery timeout in milliseconds
    pub message_timeout_ms: u64,
    /// Timeout for metadata requests made by `connect` and `ping`
    pub metadata_timeout_ms: u64,
    /// Wait before polling again after a receive error
    pub receive_retry_backoff_ms: u64,
    /// Extra librdkafka properties applied to both producer and consumer
    pub properties: HashMap<String, String>,
}

impl Default for KafkaDriverConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            session_timeout_ms: 6000,
            auto_offset_reset: "earliest".to_string(),
            enable_auto_commit: true,
            message_timeout_ms: 5000,
            metadata_timeout_ms: 5000,
            receive_retry_backoff_ms: 1000,
            properties: HashMap::new(),
        }
    }
}

impl KafkaDriverConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Self::default()
        }
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn receive_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_retry_backoff_ms)
    }

    pub(crate) fn producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", self.message_timeout_ms.to_string());
        self.apply_properties(&mut config);
        config
    }

    pub(crate) fn consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", self.enable_auto_commit.to_string())
            // Offsets are stored by the driver once a message is handled.
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false");
        self.apply_properties(&mut config);
        config
    }

    fn apply_properties(&self, config: &mut ClientConfig) {
        for (key, value) in &self.properties {
            config.set(key, value);
        }
    }
}
