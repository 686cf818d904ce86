//! In-process driver backed by per-topic message logs.
//!
//! Every topic is a single partition (0) whose offsets are indexes into the
//! topic's log. One `MemoryDriver` models one consumer group member, so
//! committed offsets are tracked per topic and a new session resumes from
//! them. Useful for running the adapter without a broker and for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::driver::{settle, ConsumeContext, Driver, MessageCallback, Settlement};
use crate::error::{DriverError, Result};
use crate::message::Message;

#[derive(Default)]
struct MemoryState {
    connected: bool,
    connects: usize,
    disconnects: usize,
    logs: HashMap<String, Vec<Message>>,
    /// Next offset to deliver per topic, advanced by commits
    committed: HashMap<String, i64>,
    acks: Vec<Message>,
    nacks: Vec<(Message, bool)>,
    callback_failures: usize,
}

pub struct MemoryDriver {
    state: Mutex<MemoryState>,
    arrivals: Notify,
    auto_commit: bool,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Create a driver that commits a message's offset once the callback
    /// returns successfully.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            arrivals: Notify::new(),
            auto_commit: true,
        }
    }

    /// Create a driver that only commits on explicit `ack`/`nack`.
    pub fn with_manual_commit() -> Self {
        Self {
            auto_commit: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All messages ever published to `topic`, in offset order.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        self.lock().logs.get(topic).cloned().unwrap_or_default()
    }

    pub fn acks(&self) -> Vec<Message> {
        self.lock().acks.clone()
    }

    pub fn nacks(&self) -> Vec<(Message, bool)> {
        self.lock().nacks.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Number of callback invocations that returned an error.
    pub fn callback_failures(&self) -> usize {
        self.lock().callback_failures
    }

    /// Next offset a new session would read from `topic`.
    pub fn committed_offset(&self, topic: &str) -> Option<i64> {
        self.lock().committed.get(topic).copied()
    }

    /// Wait until `topic` holds at least `count` messages.
    pub async fn wait_for_messages(&self, topic: &str, count: usize) -> Vec<Message> {
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.messages(topic);
            if messages.len() >= count {
                return messages;
            }
            notified.await;
        }
    }

    fn append(&self, state: &mut MemoryState, topic: &str, message: &Message) -> i64 {
        let log = state.logs.entry(topic.to_string()).or_default();
        let offset = log.len() as i64;
        let stored = Message::received(
            topic,
            0,
            offset,
            message.key().cloned(),
            message.body().clone(),
            message.headers().clone(),
        )
        .with_timestamp(message.timestamp());
        log.push(stored);
        offset
    }

    fn commit(state: &mut MemoryState, message: &Message) {
        let next = message.offset() + 1;
        let entry = state
            .committed
            .entry(message.topic().to_string())
            .or_insert(0);
        if next > *entry {
            *entry = next;
        }
    }

    fn next_message(
        &self,
        topics: &[String],
        cursors: &mut HashMap<String, i64>,
    ) -> Option<Message> {
        let state = self.lock();
        for topic in topics {
            let cursor = cursors
                .entry(topic.clone())
                .or_insert_with(|| state.committed.get(topic).copied().unwrap_or(0));
            let Some(log) = state.logs.get(topic) else {
                continue;
            };
            if let Some(message) = log.get(*cursor as usize) {
                *cursor += 1;
                return Some(message.clone());
            }
        }
        None
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.disconnects += 1;
        Ok(())
    }

    async fn publish(&self, topic: &str, message: &Message) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.connected {
                return Err(DriverError::NotConnected);
            }
            let offset = self.append(&mut state, topic, message);
            debug!("Appended message to {topic} at offset {offset}");
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn publish_batch(&self, topic: &str, messages: &[Message]) -> Result<()> {
        {
            let mut state = self.lock();
            if !state.connected {
                return Err(DriverError::NotConnected);
            }
            for message in messages {
                self.append(&mut state, topic, message);
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn consume_group(
        &self,
        mut ctx: ConsumeContext,
        group_id: &str,
        topics: &[String],
        callback: MessageCallback,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        if topics.is_empty() {
            return Err(DriverError::Subscribe("no topics to subscribe to".to_string()));
        }

        info!("Group {group_id} subscribed to {topics:?}");
        ctx.mark_subscribed();

        let mut cursors = HashMap::new();
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ctx.is_cancelled() {
                break;
            }

            let message = match self.next_message(topics, &mut cursors) {
                Some(message) => message,
                None => {
                    tokio::select! {
                        _ = ctx.cancelled() => break,
                        _ = &mut notified => {}
                    }
                    continue;
                }
            };

            let delivered = message.clone();
            match settle(callback(message).await, &delivered) {
                Ok(Settlement::Commit) => {
                    if self.auto_commit {
                        Self::commit(&mut self.lock(), &delivered);
                    }
                }
                Ok(Settlement::Abandon) => {
                    debug!(
                        "Abandoned {}[{}]@{} on cancellation",
                        delivered.topic(),
                        delivered.partition(),
                        delivered.offset()
                    );
                }
                Err(e) => {
                    // Later commits would skip this offset, so end the session
                    // and let the next one resume from the committed position.
                    error!("{e}, ending session of group {group_id}");
                    self.lock().callback_failures += 1;
                    return Err(e);
                }
            }
        }

        info!("Group {group_id} session ended");
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let mut state = self.lock();
        Self::commit(&mut state, message);
        state.acks.push(message.clone());
        Ok(())
    }

    async fn nack(&self, message: &Message, requeue: bool) -> Result<()> {
        {
            let mut state = self.lock();
            state.nacks.push((message.clone(), requeue));
            Self::commit(&mut state, message);
        }
        if requeue {
            self.publish(message.topic(), message).await?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DriverError::NotConnected)
        }
    }
}
