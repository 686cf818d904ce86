//! Per-message dispatch: route to the handler, then ack, retry, dead-letter
//! or drop depending on the outcome.

use broker_driver::{Cancelled, Driver, Message, MessageCallback};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dead_letter::DeadLetterRouter;
use crate::error::{AdapterError, Result};
use crate::registry::{Registry, Route};
use crate::retry::{self, RetryDecision};

/// How a delivered message left the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded.
    Handled,
    /// Republished to its own topic as retry number `attempt`.
    Retried { attempt: u32 },
    /// Retries exhausted; published to `dlq_topic`.
    DeadLettered { dlq_topic: String },
    /// Retries exhausted with dead-lettering disabled; nacked without requeue.
    Dropped,
    /// Cancellation fired during backoff; nothing was republished.
    Cancelled,
    /// No handler is bound to the message's topic; nacked without requeue.
    Unrouted,
}

pub struct Dispatcher {
    driver: Arc<dyn Driver>,
    registry: Arc<Registry>,
    dead_letters: DeadLetterRouter,
    auto_ack: bool,
}

impl Dispatcher {
    pub fn new(driver: Arc<dyn Driver>, registry: Arc<Registry>, auto_ack: bool) -> Self {
        Self {
            dead_letters: DeadLetterRouter::new(Arc::clone(&driver)),
            driver,
            registry,
            auto_ack,
        }
    }

    /// Handle one delivered message to completion.
    pub async fn dispatch(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let Some(route) = self.registry.route(message.topic()) else {
            warn!(
                "No handler bound to topic {}, dropping {}[{}]@{}",
                message.topic(),
                message.topic(),
                message.partition(),
                message.offset()
            );
            self.driver
                .nack(&message, false)
                .await
                .map_err(AdapterError::Nack)?;
            return Ok(DispatchOutcome::Unrouted);
        };

        debug!(
            "Dispatching {}[{}]@{} (retry {})",
            message.topic(),
            message.partition(),
            message.offset(),
            message.retry_count()
        );

        match route.handler().handle(&message).await {
            Ok(()) => {
                self.acknowledge(&message).await?;
                Ok(DispatchOutcome::Handled)
            }
            Err(err) => {
                let error = format!("{err:#}");
                self.handle_failure(message, route, &error, cancel).await
            }
        }
    }

    async fn handle_failure(
        &self,
        mut message: Message,
        route: &Route,
        error: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        match route.policy().decide(message.retry_count()) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    "Handler failed for {}[{}]@{}, retry {attempt}/{} in {delay:?}: {error}",
                    message.topic(),
                    message.partition(),
                    message.offset(),
                    route.policy().max_retries()
                );
                retry::prepare_retry(&mut message, attempt, error);

                if !retry::backoff(delay, cancel).await {
                    debug!(
                        "Retry {attempt} of {}[{}]@{} abandoned on cancellation",
                        message.topic(),
                        message.partition(),
                        message.offset()
                    );
                    return Ok(DispatchOutcome::Cancelled);
                }

                self.driver
                    .publish(message.topic(), &message)
                    .await
                    .map_err(|source| AdapterError::Republish {
                        topic: message.topic().to_string(),
                        source,
                    })?;
                // Topic, partition and offset are untouched, so this commits
                // the original delivery.
                self.acknowledge(&message).await?;
                Ok(DispatchOutcome::Retried { attempt })
            }
            RetryDecision::Exhausted => match route.dead_letter_topic() {
                Some(dlq_topic) => {
                    self.dead_letters.route(&message, dlq_topic, error).await?;
                    self.acknowledge(&message).await?;
                    Ok(DispatchOutcome::DeadLettered {
                        dlq_topic: dlq_topic.to_string(),
                    })
                }
                None => {
                    warn!(
                        "Dropping {}[{}]@{} after {} retries: {error}",
                        message.topic(),
                        message.partition(),
                        message.offset(),
                        message.retry_count()
                    );
                    self.driver
                        .nack(&message, false)
                        .await
                        .map_err(AdapterError::Nack)?;
                    Ok(DispatchOutcome::Dropped)
                }
            },
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.driver.ack(message).await.map_err(AdapterError::Ack)
    }

    /// Dispatch on behalf of a driver callback, reporting an abandoned
    /// message as [`Cancelled`] so the driver skips its commit.
    async fn dispatch_delivery(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self.dispatch(message, cancel).await? {
            DispatchOutcome::Cancelled => Err(Cancelled.into()),
            _ => Ok(()),
        }
    }

    /// Wrap the dispatcher as the callback handed to `Driver::consume_group`.
    pub fn into_callback(self: Arc<Self>, cancel: CancellationToken) -> MessageCallback {
        Arc::new(move |message: Message| -> BoxFuture<'static, anyhow::Result<()>> {
            let dispatcher = Arc::clone(&self);
            let cancel = cancel.clone();
            Box::pin(async move { dispatcher.dispatch_delivery(message, &cancel).await })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdapterConfig;
    use crate::handler::handler_fn;
    use crate::registry::HandlerBinding;
    use async_trait::async_trait;
    use broker_driver::{headers, ConsumeContext, DriverError, MemoryDriver};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Memory driver that rejects publishes to one topic.
    struct RejectingDriver {
        inner: MemoryDriver,
        reject_topic: String,
    }

    #[async_trait]
    impl Driver for RejectingDriver {
        async fn connect(&self) -> broker_driver::Result<()> {
            self.inner.connect().await
        }
        async fn disconnect(&self) -> broker_driver::Result<()> {
            self.inner.disconnect().await
        }
        async fn publish(&self, topic: &str, message: &Message) -> broker_driver::Result<()> {
            if topic == self.reject_topic {
                return Err(DriverError::Publish {
                    topic: topic.to_string(),
                    message: "rejected".to_string(),
                });
            }
            self.inner.publish(topic, message).await
        }
        async fn publish_batch(
            &self,
            topic: &str,
            messages: &[Message],
        ) -> broker_driver::Result<()> {
            self.inner.publish_batch(topic, messages).await
        }
        async fn consume_group(
            &self,
            ctx: ConsumeContext,
            group_id: &str,
            topics: &[String],
            callback: MessageCallback,
        ) -> broker_driver::Result<()> {
            self.inner
                .consume_group(ctx, group_id, topics, callback)
                .await
        }
        async fn ack(&self, message: &Message) -> broker_driver::Result<()> {
            self.inner.ack(message).await
        }
        async fn nack(&self, message: &Message, requeue: bool) -> broker_driver::Result<()> {
            self.inner.nack(message, requeue).await
        }
        async fn ping(&self) -> broker_driver::Result<()> {
            self.inner.ping().await
        }
    }

    fn failing_binding(topic: &str) -> HandlerBinding {
        HandlerBinding::new(
            topic,
            handler_fn(|_: Message| async { Err(anyhow::anyhow!("boom")) }),
        )
    }

    fn config(auto_ack: bool) -> AdapterConfig {
        AdapterConfig {
            auto_ack,
            retry_backoff_unit: Duration::from_millis(10),
            ..AdapterConfig::new("group")
        }
    }

    async fn setup(
        bindings: Vec<HandlerBinding>,
        config: &AdapterConfig,
    ) -> (Arc<MemoryDriver>, Dispatcher) {
        let driver = Arc::new(MemoryDriver::with_manual_commit());
        driver.connect().await.unwrap();
        let registry = Arc::new(Registry::build(bindings, config).unwrap());
        let dispatcher = Dispatcher::new(driver.clone(), registry, config.auto_ack);
        (driver, dispatcher)
    }

    fn delivered(topic: &str, offset: i64, retry_count: u32) -> Message {
        let mut message = Message::new(topic, "payload");
        if retry_count > 0 {
            message.set_retry_count(retry_count);
        }
        Message::received(
            topic,
            0,
            offset,
            None,
            message.body().clone(),
            message.headers().clone(),
        )
    }

    #[tokio::test]
    async fn test_success_acks_in_manual_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let binding = HandlerBinding::new(
            "orders",
            handler_fn(move |_: Message| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let (driver, dispatcher) = setup(vec![binding], &config(false)).await;

        let outcome = dispatcher
            .dispatch(delivered("orders", 5, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(driver.acks().len(), 1);
        assert_eq!(driver.committed_offset("orders"), Some(6));
    }

    #[tokio::test]
    async fn test_success_does_not_ack_in_auto_mode() {
        let binding = HandlerBinding::new("orders", handler_fn(|_: Message| async { Ok(()) }));
        let (driver, dispatcher) = setup(vec![binding], &config(true)).await;

        dispatcher
            .dispatch(delivered("orders", 0, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert!(driver.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_republishes_with_retry_headers() {
        let (driver, dispatcher) = setup(vec![failing_binding("orders")], &config(false)).await;

        let outcome = dispatcher
            .dispatch(delivered("orders", 0, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Retried { attempt: 1 });
        let republished = driver.messages("orders");
        assert_eq!(republished.len(), 1);
        assert_eq!(republished[0].retry_count(), 1);
        assert_eq!(republished[0].header(headers::RETRY_COUNT), Some("1"));
        assert_eq!(republished[0].header(headers::LAST_ERROR), Some("boom"));
        // The original delivery is committed once its retry is published.
        assert_eq!(driver.acks().len(), 1);
        assert_eq!(driver.acks()[0].offset(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dead_lettered() {
        let (driver, dispatcher) = setup(vec![failing_binding("orders")], &config(false)).await;

        let outcome = dispatcher
            .dispatch(delivered("orders", 9, 3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::DeadLettered {
                dlq_topic: "orders.dlq".to_string()
            }
        );
        assert!(driver.messages("orders").is_empty());
        let dead = driver.messages("orders.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(headers::ORIGINAL_TOPIC), Some("orders"));
        assert_eq!(dead[0].header(headers::ERROR), Some("boom"));
        assert_eq!(dead[0].header(headers::RETRY_COUNT), Some("3"));
        assert_eq!(driver.acks().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_dropped_without_dlq() {
        let binding = failing_binding("orders").dlq_enabled(false).max_retries(0);
        let (driver, dispatcher) = setup(vec![binding], &config(false)).await;

        let outcome = dispatcher
            .dispatch(delivered("orders", 0, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Dropped);
        let nacks = driver.nacks();
        assert_eq!(nacks.len(), 1);
        assert!(!nacks[0].1);
        assert!(driver.messages("orders").is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_message_is_nacked() {
        let (driver, dispatcher) = setup(vec![failing_binding("orders")], &config(true)).await;

        let outcome = dispatcher
            .dispatch(delivered("payments", 0, 0), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Unrouted);
        assert_eq!(driver.nacks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_backoff_skips_republish() {
        let (driver, dispatcher) = setup(vec![failing_binding("orders")], &config(false)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = dispatcher
            .dispatch(delivered("orders", 0, 0), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Cancelled);
        assert!(driver.messages("orders").is_empty());
        assert!(driver.acks().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_surfaced_and_not_acked() {
        let driver = Arc::new(RejectingDriver {
            inner: MemoryDriver::with_manual_commit(),
            reject_topic: "orders.dlq".to_string(),
        });
        driver.connect().await.unwrap();
        let config = config(false);
        let bindings = vec![failing_binding("orders").max_retries(0)];
        let registry = Arc::new(Registry::build(bindings, &config).unwrap());
        let dispatcher = Dispatcher::new(driver.clone(), registry, config.auto_ack);

        let err = dispatcher
            .dispatch(delivered("orders", 0, 0), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::DeadLetter { .. }));
        assert!(driver.inner.acks().is_empty());
    }

    #[tokio::test]
    async fn test_callback_reports_cancellation() {
        let (_driver, dispatcher) = setup(vec![failing_binding("orders")], &config(true)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let callback = Arc::new(dispatcher).into_callback(cancel);
        let err = callback(delivered("orders", 0, 0)).await.unwrap_err();

        assert!(broker_driver::is_cancellation(&err));
    }
}
