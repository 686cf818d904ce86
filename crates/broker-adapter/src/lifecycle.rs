//! Adapter lifecycle: start, stop and the background dispatch task.
//!
//! ```text
//! Idle -> Connecting -> Consuming -> Draining -> Stopped
//!                                                  |
//!                         start() again <----------+
//! ```
//!
//! The run state and the cancellation token of the current run sit behind a
//! single mutex. Every run owns a fresh token; the dispatch task disconnects
//! the driver on every exit path before reporting `Stopped`.

use broker_driver::{ConsumeContext, Driver, DriverError};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AdapterConfig;
use crate::dispatch::Dispatcher;
use crate::error::{AdapterError, Result};
use crate::handler::Handler;
use crate::registry::{HandlerBinding, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    Connecting,
    Consuming,
    Draining,
    Stopped,
}

impl AdapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterState::Idle => "idle",
            AdapterState::Connecting => "connecting",
            AdapterState::Consuming => "consuming",
            AdapterState::Draining => "draining",
            AdapterState::Stopped => "stopped",
        }
    }

    fn is_running(&self) -> bool {
        !matches!(self, AdapterState::Idle | AdapterState::Stopped)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct RunState {
    state: AdapterState,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<Result<()>>>,
}

struct Shared {
    driver: Arc<dyn Driver>,
    registry: Arc<Registry>,
    config: AdapterConfig,
    run: Mutex<RunState>,
    /// Mirrors `run.state` for waiters; only written with `run` locked
    state_tx: watch::Sender<AdapterState>,
}

impl Shared {
    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, run: &mut RunState, state: AdapterState) {
        run.state = state;
        self.state_tx.send_replace(state);
    }

    /// Body of the dispatch task.
    async fn run(self: Arc<Self>, ctx: ConsumeContext, cancel: CancellationToken) -> Result<()> {
        let result = self.consume(ctx, &cancel).await;

        {
            let mut run = self.lock_run();
            self.set_state(&mut run, AdapterState::Draining);
        }

        // Runs whether or not connect succeeded.
        if let Err(e) = self.driver.disconnect().await {
            warn!("Driver disconnect failed: {e}");
        }

        {
            let mut run = self.lock_run();
            run.cancel = None;
            self.set_state(&mut run, AdapterState::Stopped);
        }

        match &result {
            Ok(()) => info!("Adapter for group {} stopped", self.config.group_id),
            Err(e) => error!(
                "Adapter for group {} stopped with error: {e}",
                self.config.group_id
            ),
        }
        result
    }

    async fn consume(&self, ctx: ConsumeContext, cancel: &CancellationToken) -> Result<()> {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            connected = self.driver.connect() => connected,
        };
        connected.map_err(AdapterError::Connect)?;

        let topics = self.registry.topics();
        if topics.is_empty() {
            return Err(AdapterError::NoTopics);
        }

        {
            let mut run = self.lock_run();
            // A concurrent stop() may already have moved us to Draining.
            if run.state == AdapterState::Connecting {
                self.set_state(&mut run, AdapterState::Consuming);
            }
        }

        info!(
            "Consuming {} topic(s) as group {}: {topics:?}",
            topics.len(),
            self.config.group_id
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.registry),
            self.config.auto_ack,
        ));
        let callback = dispatcher.into_callback(cancel.clone());

        self.driver
            .consume_group(ctx, &self.config.group_id, topics, callback)
            .await
            .map_err(|source| {
                let group_id = self.config.group_id.clone();
                match source {
                    DriverError::Delivery { .. } => AdapterError::Consume { group_id, source },
                    source => AdapterError::Subscribe { group_id, source },
                }
            })
    }
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(AdapterError::TaskFailed(e.to_string())),
    }
}

/// Dispatches messages from a driver's consumer group to registered handlers.
pub struct Adapter {
    shared: Arc<Shared>,
}

impl Adapter {
    pub fn builder(driver: Arc<dyn Driver>, config: AdapterConfig) -> AdapterBuilder {
        AdapterBuilder {
            driver,
            config,
            bindings: Vec::new(),
        }
    }

    pub fn state(&self) -> AdapterState {
        self.shared.lock_run().state
    }

    pub fn topics(&self) -> &[String] {
        self.shared.registry.topics()
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.shared.config
    }

    /// Start a run with its own cancellation signal.
    pub async fn start(&self) -> Result<()> {
        self.start_with(CancellationToken::new()).await
    }

    /// Start a run that also stops when `parent` is cancelled.
    ///
    /// Returns once the driver has connected and its group subscription is
    /// accepted. Startup failures are returned here, after the driver has
    /// been disconnected again.
    pub async fn start_with(&self, parent: CancellationToken) -> Result<()> {
        let cancel = parent.child_token();
        let (ctx, subscribed) = ConsumeContext::with_subscription_signal(cancel.clone());

        {
            let mut run = self.shared.lock_run();
            if run.state.is_running() {
                return Err(AdapterError::AlreadyRunning);
            }
            self.shared.set_state(&mut run, AdapterState::Connecting);

            let shared = Arc::clone(&self.shared);
            let task_cancel = cancel.clone();
            run.task = Some(tokio::spawn(shared.run(ctx, task_cancel)));
            run.cancel = Some(cancel);
        }

        info!("Starting adapter for group {}", self.shared.config.group_id);

        if subscribed.await.is_ok() {
            return Ok(());
        }

        // The session ended before subscribing: surface its result.
        let task = self.shared.lock_run().task.take();
        match task {
            Some(task) => join(task).await,
            // A concurrent stop() collected the task.
            None => Ok(()),
        }
    }

    /// Stop the current run and wait for the driver to be disconnected.
    ///
    /// Stopping an adapter that is not running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let task = {
            let mut run = self.shared.lock_run();
            if !run.state.is_running() {
                return Ok(());
            }
            if let Some(cancel) = run.cancel.take() {
                cancel.cancel();
            }
            if run.state != AdapterState::Draining {
                self.shared.set_state(&mut run, AdapterState::Draining);
            }
            run.task.take()
        };

        info!("Stopping adapter for group {}", self.shared.config.group_id);

        match task {
            Some(task) => match join(task).await {
                Err(AdapterError::TaskFailed(e)) => return Err(AdapterError::TaskFailed(e)),
                // Already logged by the task.
                Err(_) | Ok(()) => {}
            },
            None => self.stopped().await,
        }
        Ok(())
    }

    /// Resolves once the adapter is not running.
    pub async fn stopped(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        // The sender lives as long as `self`, so this only ends by matching.
        let _ = rx.wait_for(|state| !state.is_running()).await;
    }

    pub async fn ping(&self) -> std::result::Result<(), DriverError> {
        self.shared.driver.ping().await
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        // Let a detached run wind down and disconnect on its own.
        if let Some(cancel) = self.shared.lock_run().cancel.take() {
            cancel.cancel();
        }
    }
}

pub struct AdapterBuilder {
    driver: Arc<dyn Driver>,
    config: AdapterConfig,
    bindings: Vec<HandlerBinding>,
}

impl AdapterBuilder {
    /// Bind `topic` to `handler` with the adapter defaults.
    pub fn handler(mut self, topic: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.bindings.push(HandlerBinding::new(topic, handler));
        self
    }

    pub fn binding(mut self, binding: HandlerBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(mut self, bindings: impl IntoIterator<Item = HandlerBinding>) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn build(self) -> Result<Adapter> {
        self.config.validate()?;
        let registry = Registry::build(self.bindings, &self.config)?;
        let (state_tx, _) = watch::channel(AdapterState::Idle);

        Ok(Adapter {
            shared: Arc::new(Shared {
                driver: self.driver,
                registry: Arc::new(registry),
                config: self.config,
                run: Mutex::new(RunState {
                    state: AdapterState::Idle,
                    cancel: None,
                    task: None,
                }),
                state_tx,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(AdapterState::Consuming.to_string(), "consuming");
        assert!(AdapterState::Draining.is_running());
        assert!(!AdapterState::Stopped.is_running());
        assert!(!AdapterState::Idle.is_running());
    }

    #[test]
    fn test_build_validates_config() {
        let driver = Arc::new(broker_driver::MemoryDriver::new());
        let result = Adapter::builder(driver, AdapterConfig::new("")).build();
        assert!(matches!(result, Err(AdapterError::InvalidConfig(_))));
    }
}
