//! The contract a broker technology implements to be driven by the adapter.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{DriverError, Result};
use crate::message::Message;

/// Callback invoked by a driver for every inbound message.
///
/// An `Err` means the dispatch layer could not finish handling the message
/// (for example the dead-letter publish failed). Drivers must not commit
/// progress past that message, so they end the session with
/// [`DriverError::Delivery`] and the next session starts again from it. An
/// error that downcasts to [`Cancelled`] means the message was abandoned
/// because the session is shutting down; drivers skip the commit without
/// treating it as a failure. [`settle`] applies these rules.
pub type MessageCallback =
    Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Returned through a [`MessageCallback`] when a message was abandoned
/// because the session was cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message handling cancelled")]
pub struct Cancelled;

/// Whether a callback error only reports cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.is::<Cancelled>()
}

/// What a session does with a message once its callback has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Handled; the offset may be committed.
    Commit,
    /// Abandoned on shutdown; nothing is committed.
    Abandon,
}

/// Map a callback result onto what the driver does next. A handling failure
/// comes back as [`DriverError::Delivery`] and ends the session.
pub fn settle(result: anyhow::Result<()>, message: &Message) -> Result<Settlement> {
    match result {
        Ok(()) => Ok(Settlement::Commit),
        Err(e) if is_cancellation(&e) => Ok(Settlement::Abandon),
        Err(e) => Err(DriverError::delivery(message, &e)),
    }
}

/// Context for a consumer group session.
///
/// Carries the cancellation signal that ends the session and the one-shot
/// notification the driver fires once its subscription has been accepted.
pub struct ConsumeContext {
    cancel: CancellationToken,
    subscribed: Option<oneshot::Sender<()>>,
}

impl ConsumeContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            subscribed: None,
        }
    }

    /// Create a context together with the receiver that resolves when the
    /// driver reports its subscription as accepted.
    pub fn with_subscription_signal(cancel: CancellationToken) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                cancel,
                subscribed: Some(tx),
            },
            rx,
        )
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the session should end.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Report that the group subscription is in place. Only the first call
    /// has an effect.
    pub fn mark_subscribed(&mut self) {
        if let Some(tx) = self.subscribed.take() {
            // Nobody waiting is fine.
            let _ = tx.send(());
        }
    }
}

/// A pluggable broker backend.
///
/// `connect` and `disconnect` are idempotent, and `disconnect` releases
/// whatever was acquired even when `connect` never succeeded.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Hand a message to the broker for `topic`. Success means the broker
    /// accepted it, nothing more.
    async fn publish(&self, topic: &str, message: &Message) -> Result<()>;

    async fn publish_batch(&self, topic: &str, messages: &[Message]) -> Result<()>;

    /// Join `group_id`, subscribe to `topics` and invoke `callback` for every
    /// inbound message until the context is cancelled.
    ///
    /// Implementations call [`ConsumeContext::mark_subscribed`] once the
    /// subscription is accepted. An error returned before that point is a
    /// subscribe failure; transient failures afterwards are retried
    /// internally instead of returned.
    async fn consume_group(
        &self,
        ctx: ConsumeContext,
        group_id: &str,
        topics: &[String],
        callback: MessageCallback,
    ) -> Result<()>;

    /// Commit progress for a message.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Signal failed processing. Brokers without a native negative
    /// acknowledgment implement `requeue = true` by republishing to the
    /// message's own topic.
    async fn nack(&self, message: &Message, requeue: bool) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl<D: Driver + ?Sized> Driver for Arc<D> {
    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        (**self).publish(topic, message).await
    }

    async fn publish_batch(&self, topic: &str, messages: &[Message]) -> Result<()> {
        (**self).publish_batch(topic, messages).await
    }

    async fn consume_group(
        &self,
        ctx: ConsumeContext,
        group_id: &str,
        topics: &[String],
        callback: MessageCallback,
    ) -> Result<()> {
        (**self).consume_group(ctx, group_id, topics, callback).await
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        (**self).ack(message).await
    }

    async fn nack(&self, message: &Message, requeue: bool) -> Result<()> {
        (**self).nack(message, requeue).await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }
}
