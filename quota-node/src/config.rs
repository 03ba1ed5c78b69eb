//! Node configuration

use anyhow::Context;
use quota_engine::{EngineConfig, ResourceConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    /// Engine settings inline; overridden by `node.engine_file` when set
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Resource catalog
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier, recorded on the root `node` span
    #[serde(default = "default_node_id")]
    pub id: String,

    /// YAML file with engine settings (optional)
    #[serde(default)]
    pub engine_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            engine_file: None,
        }
    }
}

fn default_node_id() -> String {
    "quota-node".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,

    /// How often resource snapshots are logged (0 = never)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

fn default_snapshot_interval() -> u64 { 60 }

impl Config {
    /// Load from a TOML file, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Config::default()
        };

        if let Some(engine_file) = config.node.engine_file.clone() {
            let yaml = std::fs::read_to_string(&engine_file)
                .with_context(|| format!("reading {}", engine_file.display()))?;
            config.engine = EngineConfig::from_yaml(&yaml)?;
        }
        config.engine.validate()?;

        Ok(config)
    }
}
