//! Configuration file for `broker-dispatch run`.
//!
//! TOML is the primary format; files ending in `.yaml` or `.yml` are read as
//! YAML with the same structure.

use anyhow::Context;
use broker_adapter::AdapterConfig;
use broker_kafka_driver::KafkaDriverConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Kafka,
    /// In-process broker fed from the `seed` messages, for trying out
    /// bindings locally
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub driver: DriverKind,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub kafka: KafkaDriverConfig,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    /// Messages published before the run starts; memory driver only
    #[serde(default)]
    pub seed: Vec<SeedMessage>,
}

/// A message placed on a topic of the in-process broker at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedMessage {
    pub topic: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// One topic bound to an external command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BindingConfig {
    pub topic: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Extra environment for the command
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Kill the command and fail the attempt after this long, e.g. "30s"
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub dlq_topic: Option<String>,
    #[serde(default)]
    pub dlq_enabled: Option<bool>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        let config = if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        config.with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.adapter.validate()?;
        for binding in &self.bindings {
            if binding.command.is_empty() {
                anyhow::bail!("Binding for topic '{}' has an empty command", binding.topic);
            }
        }
        self.check_seed()
    }

    /// Seed messages only make sense for the in-process broker.
    pub fn check_seed(&self) -> anyhow::Result<()> {
        if !self.seed.is_empty() && self.driver != DriverKind::Memory {
            anyhow::bail!(
                "{} seed message(s) configured, but seeding needs driver = \"memory\"",
                self.seed.len()
            );
        }
        Ok(())
    }

    /// Kafka settings with auto-commit following the adapter's ack mode.
    pub fn kafka_driver_config(&self) -> KafkaDriverConfig {
        KafkaDriverConfig {
            enable_auto_commit: self.adapter.auto_ack,
            ..self.kafka.clone()
        }
    }
}
