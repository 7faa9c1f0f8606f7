use std::{collections::BTreeMap, path::Path};

use serde::Deserialize;

use crate::api::LabelSet;
use crate::client::DEFAULT_CHANNEL_CAPACITY;
use crate::positions::PositionsConfig;
use crate::relabel::{self, RelabelConfig, RelabelError, RelabelRule};

/// Label holding the id of the container a target follows.
pub const CONTAINER_ID_LABEL: &str = "__meta_docker_container_id";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Relabel error: {0}")]
    Relabel(#[from] RelabelError),
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Entries buffered before targets block.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ContainerEntry {
    /// Labels a target for this container starts with.
    pub fn discovered_labels(&self) -> LabelSet {
        let mut labels = self.labels.clone();
        labels.insert(CONTAINER_ID_LABEL.to_string(), self.id.clone());
        labels
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DockerTargetConfig {
    #[serde(default)]
    pub positions: PositionsConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default, rename = "container")]
    pub containers: Vec<ContainerEntry>,
    #[serde(default)]
    pub relabel_configs: Vec<RelabelConfig>,
}

impl DockerTargetConfig {
    pub fn try_init(path: &Path) -> Result<Self, ConfigError> {
        let config = std::fs::read_to_string(path)?;
        Self::try_init_from_string(&config)
    }

    fn try_init_from_string(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    pub fn relabel_rules(&self) -> Result<Vec<RelabelRule>, ConfigError> {
        Ok(relabel::compile(self.relabel_configs.clone())?)
    }
}
