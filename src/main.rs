//! Command-line interface for broker-dispatch
//!
//! # Usage Examples
//!
//! ```bash
//! # Dispatch messages to the commands bound in a config file
//! broker-dispatch run --config dispatch.toml
//!
//! # Same bindings against another cluster
//! BROKER_DISPATCH_BROKERS=kafka-1:9092 broker-dispatch run --config dispatch.toml
//!
//! # Try the bindings on the config's [[seed]] messages, no broker needed
//! broker-dispatch run --config dispatch.toml --driver memory
//!
//! # Publish a message, body from stdin
//! echo '{"id": 1}' | broker-dispatch publish orders --key order-1 --header source=cli
//!
//! # Check that the cluster is reachable
//! broker-dispatch ping --brokers localhost:9092
//! ```
//!
//! Logging is controlled with `RUST_LOG`, e.g. `RUST_LOG=info`.

use anyhow::Context;
use broker_dispatch::{build_adapter, build_driver, publish_seed, DriverKind, FileConfig};
use broker_driver::{Driver, Message};
use broker_kafka_driver::{KafkaDriver, KafkaDriverConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;

#[derive(Parser)]
#[command(name = "broker-dispatch")]
#[command(about = "Dispatch broker messages to command handlers with retries and dead-lettering")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the consumer group and dispatch until interrupted
    Run {
        /// Path to the configuration file (TOML, or YAML by extension)
        #[arg(long, short)]
        config: PathBuf,

        /// Override the Kafka brokers from the config file
        #[arg(long, env = "BROKER_DISPATCH_BROKERS")]
        brokers: Option<String>,

        /// Override the driver from the config file
        #[arg(long, value_enum)]
        driver: Option<DriverKind>,
    },

    /// Publish a single message to a topic
    Publish {
        #[command(flatten)]
        kafka: KafkaArgs,

        /// Destination topic
        topic: String,

        /// Message key
        #[arg(long)]
        key: Option<String>,

        /// Message header (format: name=value, repeatable)
        #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Message body (read from stdin when omitted)
        #[arg(long)]
        body: Option<String>,
    },

    /// Check that the Kafka cluster is reachable
    Ping {
        #[command(flatten)]
        kafka: KafkaArgs,
    },
}

#[derive(Args)]
struct KafkaArgs {
    /// Kafka brokers (comma-separated list)
    #[arg(long, env = "BROKER_DISPATCH_BROKERS", default_value = "localhost:9092")]
    brokers: String,

    /// Producer delivery and metadata timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl KafkaArgs {
    fn driver(&self) -> KafkaDriver {
        KafkaDriver::new(KafkaDriverConfig {
            message_timeout_ms: self.timeout_ms,
            metadata_timeout_ms: self.timeout_ms,
            ..KafkaDriverConfig::new(&self.brokers)
        })
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("Invalid header '{s}', expected NAME=VALUE")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            brokers,
            driver,
        } => {
            let mut file_config = FileConfig::from_file(&config)?;
            if let Some(brokers) = brokers {
                file_config.kafka.brokers = brokers;
            }
            if let Some(driver) = driver {
                file_config.driver = driver;
            }
            run_dispatch(file_config).await
        }
        Commands::Publish {
            kafka,
            topic,
            key,
            headers,
            body,
        } => {
            let body = match body {
                Some(body) => body.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    tokio::io::stdin()
                        .read_to_end(&mut buf)
                        .await
                        .context("Failed to read message body from stdin")?;
                    buf
                }
            };

            let mut message = Message::new(topic.as_str(), body);
            if let Some(key) = key {
                message = message.with_key(key);
            }
            for (name, value) in headers {
                message = message.with_header(name, value);
            }

            let driver = kafka.driver();
            driver
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}", kafka.brokers))?;
            let published = driver
                .publish(&topic, &message)
                .await
                .with_context(|| format!("Failed to publish to {topic}"));
            driver.disconnect().await?;
            published?;

            info!("Published {} byte(s) to {topic}", message.body().len());
            Ok(())
        }
        Commands::Ping { kafka } => {
            let driver = kafka.driver();
            driver
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}", kafka.brokers))?;
            let pinged = driver.ping().await;
            driver.disconnect().await?;
            pinged.with_context(|| format!("Kafka at {} is not reachable", kafka.brokers))?;

            println!("Kafka at {} is reachable", kafka.brokers);
            Ok(())
        }
    }
}

async fn run_dispatch(config: FileConfig) -> anyhow::Result<()> {
    let driver = build_driver(&config);
    let seeded = publish_seed(&config, driver.as_ref()).await?;
    if seeded > 0 {
        info!("Seeded {seeded} message(s)");
    }
    let adapter = build_adapter(&config, driver)?;

    adapter
        .start()
        .await
        .with_context(|| format!("Failed to start consumer group {}", config.adapter.group_id))?;
    info!(
        "Dispatching {} topic(s) as group {}; press Ctrl-C to stop",
        adapter.topics().len(),
        config.adapter.group_id
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
        }
        _ = adapter.stopped() => {
            anyhow::bail!("Dispatch stopped unexpectedly; see the log for the cause");
        }
    }

    adapter.stop().await.context("Failed to stop adapter")?;
    Ok(())
}
