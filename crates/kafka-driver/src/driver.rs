use async_trait::async_trait;
use broker_driver::{
    settle, ConsumeContext, Driver, DriverError, Message, MessageCallback, Result, Settlement,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::KafkaDriverConfig;
use crate::convert::{to_kafka_headers, to_message};

/// [`Driver`] backed by a Kafka consumer group.
///
/// One producer is shared by every publish; the consumer only exists while
/// [`Driver::consume_group`] runs. Offsets are stored or committed once a
/// message has been handled, never on receipt.
pub struct KafkaDriver {
    config: KafkaDriverConfig,
    producer: RwLock<Option<FutureProducer>>,
    consumer: RwLock<Option<Arc<StreamConsumer>>>,
}

impl KafkaDriver {
    pub fn new(config: KafkaDriverConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
            consumer: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &KafkaDriverConfig {
        &self.config
    }

    fn producer(&self) -> Result<FutureProducer> {
        self.producer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DriverError::NotConnected)
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer>> {
        self.consumer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DriverError::NotConnected)
    }

    fn set_consumer(&self, consumer: Option<Arc<StreamConsumer>>) {
        *self.consumer.write().unwrap_or_else(|e| e.into_inner()) = consumer;
    }

    /// Ask the cluster for metadata; librdkafka connects lazily, so this is
    /// the first point where an unreachable broker shows up.
    async fn fetch_metadata(&self, producer: FutureProducer) -> Result<usize> {
        let timeout = self.config.metadata_timeout();
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| DriverError::Backend(format!("Metadata task failed: {e}")))?
        .map_err(|e| DriverError::Connection(format!("Failed to fetch metadata: {e}")))?;
        Ok(brokers)
    }

    async fn send(&self, producer: &FutureProducer, topic: &str, message: &Message) -> Result<()> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic)
            .payload(message.body().as_ref())
            .headers(to_kafka_headers(message.headers()));
        if let Some(key) = message.key() {
            record = record.key(key.as_ref());
        }

        producer
            .send(record, self.config.message_timeout())
            .await
            .map_err(|(err, _)| DriverError::Publish {
                topic: topic.to_string(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    /// Record progress past `message` for its partition.
    fn commit(&self, message: &Message) -> Result<()> {
        if !message.is_delivered() {
            return Err(DriverError::Commit(format!(
                "message on {} has no broker position",
                message.topic()
            )));
        }
        let consumer = self.consumer()?;
        let tpl = position_after(message)?;

        let committed = if self.config.enable_auto_commit {
            consumer.store_offsets(&tpl)
        } else {
            consumer.commit(&tpl, CommitMode::Async)
        };
        committed.map_err(|e| DriverError::Commit(format!("Failed to commit offset: {e}")))
    }

    /// Stored offsets are committed by the client's auto-commit timer.
    fn store_handled(&self, consumer: &StreamConsumer, message: &Message) {
        let stored = position_after(message).and_then(|tpl| {
            consumer
                .store_offsets(&tpl)
                .map_err(|e| DriverError::Commit(e.to_string()))
        });
        if let Err(e) = stored {
            warn!(
                "Failed to store offset {} for {}/{}: {e}",
                message.offset(),
                message.topic(),
                message.partition()
            );
        }
    }
}

fn position_after(message: &Message) -> Result<TopicPartitionList> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(
        message.topic(),
        message.partition(),
        Offset::Offset(message.offset() + 1),
    )
    .map_err(|e| DriverError::Commit(format!("Failed to add partition offset: {e}")))?;
    Ok(tpl)
}

/// Receive the next record and copy it out before the borrow of the
/// consumer ends.
async fn next_message(consumer: &StreamConsumer) -> KafkaResult<Message> {
    consumer.recv().await.map(|record| to_message(&record))
}

#[async_trait]
impl Driver for KafkaDriver {
    async fn connect(&self) -> Result<()> {
        if self.producer().is_ok() {
            return Ok(());
        }
        if self.config.brokers.trim().is_empty() {
            return Err(DriverError::InvalidConfig("brokers must not be empty".to_string()));
        }

        let producer: FutureProducer = self
            .config
            .producer_config()
            .create()
            .map_err(|e| DriverError::Connection(format!("Failed to create producer: {e}")))?;
        let brokers = self.fetch_metadata(producer.clone()).await?;

        *self.producer.write().unwrap_or_else(|e| e.into_inner()) = Some(producer);
        info!("Connected to Kafka at {} ({brokers} broker(s))", self.config.brokers);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_consumer(None);
        let producer = self
            .producer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(producer) = producer else {
            return Ok(());
        };
        let timeout = self.config.message_timeout();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| DriverError::Backend(format!("Flush task failed: {e}")))?;
        flushed.map_err(|e| DriverError::Backend(format!("Failed to flush producer: {e}")))?;

        info!("Disconnected from Kafka at {}", self.config.brokers);
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        let producer = self.producer()?;
        self.send(&producer, topic, message).await
    }

    async fn publish_batch(&self, topic: &str, messages: &[Message]) -> Result<()> {
        let producer = self.producer()?;
        let sends = messages
            .iter()
            .map(|message| self.send(&producer, topic, message));
        futures::future::try_join_all(sends).await?;
        Ok(())
    }

    async fn consume_group(
        &self,
        mut ctx: ConsumeContext,
        group_id: &str,
        topics: &[String],
        callback: MessageCallback,
    ) -> Result<()> {
        self.producer()?;
        if topics.is_empty() {
            return Err(DriverError::Subscribe("no topics to subscribe to".to_string()));
        }

        let consumer: StreamConsumer = self
            .config
            .consumer_config(group_id)
            .create()
            .map_err(|e| DriverError::Subscribe(format!("Failed to create consumer: {e}")))?;
        let topic_names: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_names)
            .map_err(|e| DriverError::Subscribe(format!("Failed to subscribe to topics: {e}")))?;

        let consumer = Arc::new(consumer);
        self.set_consumer(Some(Arc::clone(&consumer)));
        ctx.mark_subscribed();
        info!("Joined consumer group {group_id} on {topics:?}");

        loop {
            let received = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                received = next_message(&consumer) => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    let backoff = self.config.receive_retry_backoff();
                    warn!("Error receiving message, retrying in {backoff:?}: {e}");
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            let position = message.clone();
            match settle(callback(message).await, &position) {
                Ok(Settlement::Commit) => {
                    if self.config.enable_auto_commit {
                        self.store_handled(&consumer, &position);
                    }
                }
                Ok(Settlement::Abandon) => {
                    debug!(
                        "Abandoned offset {} of {}/{} on shutdown",
                        position.offset(),
                        position.topic(),
                        position.partition()
                    );
                }
                Err(e) => {
                    // Storing a later offset would skip this one; leave the
                    // group so the next session resumes from the last commit.
                    error!("{e}, leaving consumer group {group_id}");
                    self.set_consumer(None);
                    return Err(e);
                }
            }
        }

        self.set_consumer(None);
        info!("Left consumer group {group_id}");
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        self.commit(message)
    }

    async fn nack(&self, message: &Message, requeue: bool) -> Result<()> {
        if requeue {
            self.publish(message.topic(), message).await?;
        }
        self.commit(message)
    }

    async fn ping(&self) -> Result<()> {
        let producer = self.producer()?;
        self.fetch_metadata(producer).await.map(|_| ())
    }
}
