//! Handler that runs an external command per message.

use anyhow::Context;
use async_trait::async_trait;
use broker_adapter::{parse_duration, Handler};
use broker_driver::Message;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::config::BindingConfig;

/// Runs `program args...` for every message.
///
/// The body is written to the command's stdin and the message metadata is
/// exposed through `BROKER_*` environment variables. The command's stdout and
/// stderr are inherited. Anything but a zero exit status fails the attempt.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &BindingConfig) -> anyhow::Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .with_context(|| format!("Binding for topic '{}' has an empty command", config.topic))?;

        let timeout = config
            .timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
            .with_context(|| format!("Invalid timeout for topic '{}'", config.topic))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: config.env.clone(),
            timeout,
        })
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command_for(&self, message: &Message) -> Command {
        let key = message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .env("BROKER_TOPIC", message.topic())
            .env("BROKER_PARTITION", message.partition().to_string())
            .env("BROKER_OFFSET", message.offset().to_string())
            .env("BROKER_KEY", key)
            .env("BROKER_RETRY_COUNT", message.retry_count().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, message: &Message) -> anyhow::Result<()> {
        let mut child = self
            .command_for(message)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(message.body()).await {
                Ok(()) => {}
                // The command does not read its input.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to write to '{}'", self.program))
                }
            }
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        if !status.success() {
            anyhow::bail!("'{}' exited with {status}", self.program);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for CommandHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        debug!(
            "Running '{}' for offset {} of {}",
            self.program,
            message.offset(),
            message.topic()
        );

        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.run(message))
                .await
                .map_err(|_| anyhow::anyhow!("'{}' timed out after {timeout:?}", self.program))?,
            None => self.run(message).await,
        }
    }
}
