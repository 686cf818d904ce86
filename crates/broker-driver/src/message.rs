//! Message type flowing between drivers and the dispatch layer.
//!
//! The broker-assigned parts of a message (topic, key, body, partition,
//! offset) are private and only readable once the message exists. The retry
//! count and headers can be changed through the `&mut self` methods below,
//! which handlers never get access to since they only see `&Message`.

use bytes::Bytes;
use std::collections::HashMap;

use crate::headers;

/// Partition value for messages that have not been assigned one by a broker.
pub const UNASSIGNED_PARTITION: i32 = -1;

/// Offset value for messages that have not been stored by a broker.
pub const UNASSIGNED_OFFSET: i64 = -1;

/// A broker message with its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    topic: String,
    key: Option<Bytes>,
    body: Bytes,
    headers: HashMap<String, String>,
    partition: i32,
    offset: i64,
    retry_count: u32,
    /// Broker timestamp in milliseconds since epoch (if available)
    timestamp: Option<i64>,
}

impl Message {
    /// Create an outbound message that has not been delivered by any broker.
    pub fn new(topic: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            body: body.into(),
            headers: HashMap::new(),
            partition: UNASSIGNED_PARTITION,
            offset: UNASSIGNED_OFFSET,
            retry_count: 0,
            timestamp: None,
        }
    }

    /// Build a message as delivered by a driver.
    ///
    /// The retry count is restored from the `x-retry-count` header so that it
    /// survives a republish round trip through the broker. A missing or
    /// unparsable header counts as zero retries.
    pub fn received(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        body: Bytes,
        headers: HashMap<String, String>,
    ) -> Self {
        let retry_count = headers
            .get(headers::RETRY_COUNT)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0);

        Self {
            topic: topic.into(),
            key,
            body,
            headers,
            partition,
            offset,
            retry_count,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<i64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Set the retry count, keeping the `x-retry-count` header in step.
    pub fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
        self.headers
            .insert(headers::RETRY_COUNT.to_string(), retry_count.to_string());
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Whether a broker has assigned this message a position.
    pub fn is_delivered(&self) -> bool {
        self.partition != UNASSIGNED_PARTITION && self.offset != UNASSIGNED_OFFSET
    }
}
