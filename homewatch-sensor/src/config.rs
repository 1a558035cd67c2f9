//! Sensor node configuration
//!
//! TOML file at `$HOMEWATCH_SENSOR_CONFIG`, or `<config dir>/homewatch/sensor.toml`:
//!
//! ```toml
//! [node]
//! username = "hall"
//!
//! [mqtt]
//! host = "192.168.1.10"
//! port = 1883
//!
//! [[sensors]]
//! id = 1
//! description = "router"
//! alert_levels = [1]
//! source = { kind = "ping", host = "192.168.1.1" }
//! ```

use anyhow::{Context, Result};
use homewatch_core::config::{validate_sensors, duration_secs};
use homewatch_core::source::ReadingStore;
use homewatch_core::{CollectorConfig, MqttSettings, NodeSettings, SensorConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "HOMEWATCH_SENSOR_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorNodeConfig {
    #[serde(default = "default_node")]
    pub node: NodeSettings,
    #[serde(default)]
    pub mqtt: MqttSettings,
    /// How often the sensor queues are drained and published.
    #[serde(default = "default_publish_interval", with = "duration_secs")]
    pub publish_interval: Duration,
    /// The registration is also repeated at this interval so the server keeps seeing fresh sensor states.
    #[serde(default = "default_registration_interval", with = "duration_secs")]
    pub registration_interval: Duration,
    /// Changed values of sensors with data are sent to the server at this interval.
    #[serde(default = "default_data_interval", with = "duration_secs")]
    pub data_interval: Duration,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
}

impl Default for SensorNodeConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            mqtt: MqttSettings::default(),
            publish_interval: default_publish_interval(),
            registration_interval: default_registration_interval(),
            data_interval: default_data_interval(),
            sensors: Vec::new(),
            collectors: Vec::new(),
        }
    }
}

fn default_node() -> NodeSettings {
    NodeSettings {
        username: gethostname::gethostname().to_string_lossy().to_string(),
        persistent: true,
    }
}

fn default_publish_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_registration_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_data_interval() -> Duration {
    Duration::from_secs(10)
}

impl SensorNodeConfig {
    /// Loads the node configuration; a missing file yields an empty default node.
    pub async fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        if !path.exists() {
            warn!(path = %path.display(), "no sensor configuration found, running without sensors");
            return Ok(Self::default());
        }
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: SensorNodeConfig =
            toml::from_str(&content).with_context(|| format!("Invalid sensor configuration {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), sensors = config.sensors.len(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        if self.publish_interval.is_zero() || self.registration_interval.is_zero() || self.data_interval.is_zero() {
            anyhow::bail!("publish_interval, registration_interval and data_interval must be positive");
        }
        validate_sensors(&self.sensors)?;
        Ok(())
    }

    /// `$HOMEWATCH_SENSOR_CONFIG` or the OS config directory.
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("homewatch");
        path.push("sensor.toml");
        Ok(path)
    }

    /// Whether any sensor reads from the shared provider store.
    pub fn needs_store(&self) -> bool {
        !self.collectors.is_empty()
    }

    pub fn new_store(&self) -> Option<ReadingStore> {
        self.needs_store().then(ReadingStore::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_core::SourceConfig;

    const SAMPLE: &str = r#"
publish_interval = 0.2

[node]
username = "hall"

[mqtt]
host = "10.0.0.2"
port = 1884

[[sensors]]
id = 1
description = "router"
alert_levels = [1, 2]
alert_delay = 5
source = { kind = "ping", host = "10.0.0.1", count = 2 }

[[sensors]]
id = 2
description = "cellar temperature"
alert_levels = [3]
interval = 30
source = { kind = "number", threshold = 2.0, ordering = "lt", unit = "°C", reader = { from = "store", key = "cellar" } }

[[collectors]]
execute = "/usr/local/bin/weather"
keys = ["cellar", "outside"]
"#;

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = SensorNodeConfig::load_from(&path).await.unwrap();
        assert_eq!(config.node.username, "hall");
        assert!(!config.node.persistent);
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.publish_interval, Duration::from_millis(200));
        assert_eq!(config.registration_interval, Duration::from_secs(60));
        assert_eq!(config.data_interval, Duration::from_secs(10));
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.sensors[0].alert_delay, Duration::from_secs(5));
        assert!(matches!(config.sensors[1].source, SourceConfig::Number { .. }));
        assert_eq!(config.collectors[0].max_tolerated_fails, 3);
        assert!(config.new_store().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_sensor_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.toml");
        let duplicated = SAMPLE.replace("id = 2", "id = 1");
        std::fs::write(&path, duplicated).unwrap();
        assert!(SensorNodeConfig::load_from(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_publish_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensor.toml");
        std::fs::write(&path, SAMPLE.replace("publish_interval = 0.2", "publish_interval = 0")).unwrap();
        assert!(SensorNodeConfig::load_from(&path).await.is_err());
    }

    #[test]
    fn test_default_config() {
        let config = SensorNodeConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.sensors.is_empty());
        assert!(config.new_store().is_none());
    }
}
