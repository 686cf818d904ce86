use thiserror::Error;

use crate::message::Message;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Driver is not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Publish to topic '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// A delivered message could not be handled. The session ends without
    /// committing it so the next session starts again at `offset`.
    #[error("Handling {topic}[{partition}]@{offset} failed: {message}")]
    Delivery {
        topic: String,
        partition: i32,
        offset: i64,
        message: String,
    },

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl DriverError {
    /// Failure to hand `message` off, carrying the callback's error chain.
    pub fn delivery(message: &Message, source: &anyhow::Error) -> Self {
        DriverError::Delivery {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            message: format!("{source:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
