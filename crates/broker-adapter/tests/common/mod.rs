//! Shared helpers for adapter integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use broker_adapter::{AdapterConfig, Handler};
use broker_driver::{
    headers, ConsumeContext, Driver, DriverError, MemoryDriver, Message, MessageCallback,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("broker_adapter=debug,broker_driver=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn config(max_retries: u32, backoff_unit: Duration) -> AdapterConfig {
    AdapterConfig {
        max_retries,
        retry_backoff_unit: backoff_unit,
        ..AdapterConfig::new("test-group")
    }
}

/// One handler invocation as seen by [`Recorder`].
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub retry_count: u32,
    pub retry_header: Option<String>,
    pub body: String,
}

/// Handler that records every invocation and fails the first `failures`.
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    failures: usize,
    notify: Notify,
}

impl Recorder {
    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures,
            notify: Notify::new(),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing_first(usize::MAX)
    }

    pub fn succeeding() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) -> Vec<Call> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                at: Instant::now(),
                retry_count: message.retry_count(),
                retry_header: message.header(headers::RETRY_COUNT).map(str::to_string),
                body: String::from_utf8_lossy(message.body()).into_owned(),
            });
            calls.len()
        };
        self.notify.notify_waiters();

        if attempt <= self.failures {
            anyhow::bail!("attempt {attempt} failed");
        }
        Ok(())
    }
}

/// Memory driver with injectable connect, subscribe and dead-letter failures.
pub struct FaultyDriver {
    pub inner: MemoryDriver,
    pub fail_connect: bool,
    pub fail_subscribe: bool,
    reject_dead_letters: AtomicBool,
}

impl FaultyDriver {
    fn new(fail_connect: bool, fail_subscribe: bool, reject_dead_letters: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryDriver::new(),
            fail_connect,
            fail_subscribe,
            reject_dead_letters: AtomicBool::new(reject_dead_letters),
        })
    }

    pub fn failing_connect() -> Arc<Self> {
        Self::new(true, false, false)
    }

    pub fn failing_subscribe() -> Arc<Self> {
        Self::new(false, true, false)
    }

    /// Rejects every publish to a `.dlq` topic until told otherwise.
    pub fn rejecting_dead_letters() -> Arc<Self> {
        Self::new(false, false, true)
    }

    pub fn set_reject_dead_letters(&self, reject: bool) {
        self.reject_dead_letters.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl Driver for FaultyDriver {
    async fn connect(&self) -> broker_driver::Result<()> {
        if self.fail_connect {
            return Err(DriverError::Connection("broker unreachable".to_string()));
        }
        self.inner.connect().await
    }

    async fn disconnect(&self) -> broker_driver::Result<()> {
        self.inner.disconnect().await
    }

    async fn publish(&self, topic: &str, message: &Message) -> broker_driver::Result<()> {
        if topic.ends_with(".dlq") && self.reject_dead_letters.load(Ordering::SeqCst) {
            return Err(DriverError::Publish {
                topic: topic.to_string(),
                message: "leader not available".to_string(),
            });
        }
        self.inner.publish(topic, message).await
    }

    async fn publish_batch(&self, topic: &str, messages: &[Message]) -> broker_driver::Result<()> {
        self.inner.publish_batch(topic, messages).await
    }

    async fn consume_group(
        &self,
        ctx: ConsumeContext,
        group_id: &str,
        topics: &[String],
        callback: MessageCallback,
    ) -> broker_driver::Result<()> {
        if self.fail_subscribe {
            return Err(DriverError::Subscribe(format!(
                "group {group_id} not authorized"
            )));
        }
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
