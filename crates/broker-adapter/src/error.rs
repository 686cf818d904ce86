use broker_driver::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Adapter is already running")]
    AlreadyRunning,

    #[error("No topics to subscribe to: register at least one handler")]
    NoTopics,

    #[error("Topic '{0}' is bound to more than one handler")]
    DuplicateBinding(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect driver: {0}")]
    Connect(#[source] DriverError),

    #[error("Failed to subscribe consumer group '{group_id}': {source}")]
    Subscribe {
        group_id: String,
        #[source]
        source: DriverError,
    },

    #[error("Consumer group '{group_id}' stopped on an unhandled message: {source}")]
    Consume {
        group_id: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to republish message to '{topic}': {source}")]
    Republish {
        topic: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to publish dead letter from '{topic}' to '{dlq_topic}': {source}")]
    DeadLetter {
        topic: String,
        dlq_topic: String,
        #[source]
        source: DriverError,
    },

    #[error("Failed to acknowledge message: {0}")]
    Ack(#[source] DriverError),

    #[error("Failed to negatively acknowledge message: {0}")]
    Nack(#[source] DriverError),

    #[error("Dispatch task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
