//! Alert node configuration (TOML)
//!
//! ```toml
//! [node]
//! username = "siren"
//!
//! [[alerts]]
//! id = 1
//! description = "attic siren"
//! alert_levels = [1, 2]
//! handler = { type = "command", triggered = "/usr/local/bin/siren on {sensor_id}", normal = "/usr/local/bin/siren off" }
//! ```

use crate::handlers::HandlerConfig;
use anyhow::{Context, Result};
use homewatch_core::config::validate_alerts;
use homewatch_core::{AlertConfig, MqttSettings, NodeSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_ENV: &str = "HOMEWATCH_ALERT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEntry {
    #[serde(flatten)]
    pub alert: AlertConfig,
    #[serde(default = "default_handler")]
    pub handler: HandlerConfig,
}

fn default_handler() -> HandlerConfig {
    HandlerConfig::Log
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNodeConfig {
    pub node: NodeSettings,
    #[serde(default)]
    pub mqtt: MqttSettings,
    pub alerts: Vec<AlertEntry>,
}

impl AlertNodeConfig {
    /// An alert node without a configuration file has nothing to do, so a missing file is an error.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AlertNodeConfig =
            toml::from_str(&content).with_context(|| format!("Invalid alert configuration {}", path.display()))?;
        config.node.validate()?;
        validate_alerts(config.alerts.iter().map(|entry| &entry.alert))?;
        info!(path = %path.display(), alerts = config.alerts.len(), "configuration loaded");
        Ok(config)
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("homewatch");
        path.push("alert.toml");
        Ok(path)
    }
}
