use anyhow::{Context, Result};
use homewatch_core::{MqttSettings, Profile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "HOMEWATCH_SERVER_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Sensors of connected nodes not updated for this long are reported by the watchdog.
    #[serde(default = "default_sensor_timeout")]
    pub sensor_timeout_secs: u64,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub alert_levels: Vec<AlertLevelConfig>,
}

/// Display name of an alert level, for reporting only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AlertLevelConfig {
    pub level: i64,
    pub name: String,
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/storage.json")
}

fn default_sensor_timeout() -> u64 {
    300
}

fn default_profiles() -> Vec<Profile> {
    vec![Profile { id: 0, name: "default".into() }]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            http_addr: default_http_addr(),
            storage_path: default_storage_path(),
            sensor_timeout_secs: default_sensor_timeout(),
            profiles: default_profiles(),
            alert_levels: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn profile(&self, id: i64) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.id == id)
    }

    pub fn alert_level_name(&self, level: i64) -> Option<&str> {
        self.alert_levels.iter().find(|l| l.level == level).map(|l| l.name.as_str())
    }

    fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            anyhow::bail!("at least one profile is required");
        }
        let mut ids: Vec<i64> = self.profiles.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.profiles.len() {
            anyhow::bail!("duplicate profile id");
        }
        let mut levels: Vec<i64> = self.alert_levels.iter().map(|l| l.level).collect();
        levels.sort_unstable();
        levels.dedup();
        if levels.len() != self.alert_levels.len() {
            anyhow::bail!("duplicate alert level");
        }
        Ok(())
    }
}

/// Reads `$HOMEWATCH_SERVER_CONFIG` (or `server.yaml`). A missing or empty file means defaults.
pub async fn load_config() -> Result<ServerConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "server.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "no server configuration, using defaults");
        return Ok(ServerConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if txt.trim().is_empty() {
        return Ok(ServerConfig::default());
    }
    let config: ServerConfig =
        serde_yaml::from_str(&txt).with_context(|| format!("Invalid server configuration {}", path.display()))?;
    config.validate()?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}
