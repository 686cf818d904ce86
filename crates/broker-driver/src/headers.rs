//! Header names stamped on messages by the dispatch layer.

/// Number of retries already made for a message.
pub const RETRY_COUNT: &str = "x-retry-count";

/// Stringified error of the most recent failed attempt.
pub const LAST_ERROR: &str = "x-last-error";

/// Topic the message was originally consumed from (dead letters only).
pub const ORIGINAL_TOPIC: &str = "x-original-topic";

/// Error that exhausted the retry budget (dead letters only).
pub const ERROR: &str = "x-error";

/// RFC 3339 timestamp of the terminal failure (dead letters only).
pub const FAILED_AT: &str = "x-failed-at";
