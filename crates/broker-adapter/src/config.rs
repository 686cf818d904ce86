//! Adapter configuration.

use anyhow::Context;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::error::{AdapterError, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_UNIT: Duration = Duration::from_secs(1);
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

/// Configuration shared by every topic the adapter dispatches.
///
/// Per-topic overrides live on [`crate::HandlerBinding`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Consumer group the adapter joins as a single member
    pub group_id: String,
    /// Trust the driver's own commit policy instead of calling `ack()`
    ///
    /// When false, the adapter acknowledges every message explicitly after it
    /// has been handled, republished or dead-lettered.
    pub auto_ack: bool,
    /// Retries allowed before a message is dead-lettered or dropped
    pub max_retries: u32,
    /// Backoff before retry `n` is `retry_backoff_unit * n`
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_backoff_unit: Duration,
    /// Route exhausted messages to a dead-letter topic instead of dropping them
    pub dlq_enabled: bool,
    /// Appended to a topic name to derive its dead-letter topic
    pub dlq_suffix: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            group_id: "broker-dispatch".to_string(),
            auto_ack: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_unit: DEFAULT_RETRY_BACKOFF_UNIT,
            dlq_enabled: true,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
        }
    }
}

impl AdapterConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "group_id must not be empty".to_string(),
            ));
        }
        if self.dlq_enabled && self.dlq_suffix.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "dlq_suffix must not be empty when dead-lettering is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Dead-letter topic derived from `topic` and the configured suffix.
    pub fn dlq_topic_for(&self, topic: &str) -> String {
        format!("{topic}{}", self.dlq_suffix)
    }
}

/// Parse a duration string like "250ms", "10s", "5m", "1h" or "30".
///
/// Plain numbers are interpreted as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // "ms" must be checked before "m" and "s"
    if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid milliseconds value: {num_str}"))?;
        return Ok(Duration::from_millis(millis));
    }
    if let Some(num_str) = s.strip_suffix('h') {
        let hours: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid hours value: {num_str}"))?;
        let secs = hours
            .checked_mul(3600)
            .with_context(|| format!("Hours value out of range: {num_str}"))?;
        return Ok(Duration::from_secs(secs));
    }
    if let Some(num_str) = s.strip_suffix('m') {
        let minutes: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid minutes value: {num_str}"))?;
        let secs = minutes
            .checked_mul(60)
            .with_context(|| format!("Minutes value out of range: {num_str}"))?;
        return Ok(Duration::from_secs(secs));
    }
    if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str
            .trim()
            .parse()
            .with_context(|| format!("Invalid seconds value: {num_str}"))?;
        return Ok(Duration::from_secs(secs));
    }

    let secs: u64 = s
        .parse()
        .with_context(|| format!("Invalid duration value: {s}"))?;
    Ok(Duration::from_secs(secs))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

/// Serde helper accepting either a bare number of seconds or a suffixed string.
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::default();
        assert!(config.auto_ack);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_unit, Duration::from_secs(1));
        assert!(config.dlq_enabled);
        assert_eq!(config.dlq_suffix, ".dlq");
        assert_eq!(config.dlq_topic_for("orders"), "orders.dlq");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 30 ").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        let err = parse_duration("5124095576030432h").unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(parse_duration("307445734561825861m").is_err());
        assert_eq!(
            parse_duration("5124095576030431h").unwrap(),
            Duration::from_secs(5124095576030431 * 3600)
        );
    }

    #[test]
    fn test_deserialize_with_partial_fields() {
        let config: AdapterConfig = toml::from_str(
            r#"
            group_id = "billing"
            max_retries = 5
            retry_backoff_unit = "250ms"
            "#,
        )
        .unwrap();

        assert_eq!(config.group_id, "billing");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff_unit, Duration::from_millis(250));
        assert!(config.auto_ack);
        assert_eq!(config.dlq_suffix, ".dlq");
    }

    #[test]
    fn test_deserialize_numeric_backoff() {
        let config: AdapterConfig = toml::from_str("retry_backoff_unit = 2").unwrap();
        assert_eq!(config.retry_backoff_unit, Duration::from_secs(2));
    }

    #[test]
    fn test_validate() {
        assert!(AdapterConfig::new("group").validate().is_ok());
        assert!(matches!(
            AdapterConfig::new("  ").validate(),
            Err(AdapterError::InvalidConfig(_))
        ));

        let mut config = AdapterConfig::new("group");
        config.dlq_suffix = String::new();
        assert!(config.validate().is_err());
        config.dlq_enabled = false;
        assert!(config.validate().is_ok());
    }
}
