//! Dead-letter hand-off for messages that exhausted their retries.

use broker_driver::{headers, Driver, Message};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::error::{AdapterError, Result};

/// Build the dead-letter copy of `message` for `dlq_topic`.
///
/// Key and body are copied; headers are the original headers plus the
/// failure context. The result is a new outbound message with no position.
pub fn build_dead_letter(
    message: &Message,
    dlq_topic: &str,
    error: &str,
    failed_at: DateTime<Utc>,
) -> Message {
    let mut dead_letter = Message::new(dlq_topic, message.body().clone());
    if let Some(key) = message.key() {
        dead_letter = dead_letter.with_key(key.clone());
    }
    for (name, value) in message.headers() {
        dead_letter.set_header(name.clone(), value.clone());
    }

    dead_letter.set_header(headers::ORIGINAL_TOPIC, message.topic());
    dead_letter.set_header(headers::ERROR, error);
    dead_letter.set_header(
        headers::FAILED_AT,
        failed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    dead_letter.set_retry_count(message.retry_count());
    dead_letter
}

/// Publishes dead letters through the driver.
#[derive(Clone)]
pub struct DeadLetterRouter {
    driver: Arc<dyn Driver>,
}

impl DeadLetterRouter {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Publish the dead-letter copy of `message` to `dlq_topic`.
    ///
    /// A failed publish is returned to the caller: the message is not
    /// considered handled and must not be acknowledged.
    pub async fn route(&self, message: &Message, dlq_topic: &str, error: &str) -> Result<Message> {
        let dead_letter = build_dead_letter(message, dlq_topic, error, Utc::now());

        warn!(
            "Dead-lettering {}[{}]@{} to {dlq_topic} after {} retries: {error}",
            message.topic(),
            message.partition(),
            message.offset(),
            message.retry_count()
        );

        self.driver
            .publish(dlq_topic, &dead_letter)
            .await
            .map_err(|source| AdapterError::DeadLetter {
                topic: message.topic().to_string(),
                dlq_topic: dlq_topic.to_string(),
                source,
            })?;

        Ok(dead_letter)
    }
}
