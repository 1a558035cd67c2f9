//! Configuration types shared by the node binaries.
//!
//! Files are parsed by each binary (TOML for nodes, YAML for the server); this
//! module only defines the shapes and the validation that makes a bad
//! definition fatal at startup.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// One monitored condition, as configured on a sensor node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub id: i64,
    #[serde(default)]
    pub description: String,
    /// Raw value the data source reports when abnormal (0 or 1).
    #[serde(default = "default_trigger_state")]
    pub trigger_state: u8,
    #[serde(default = "default_true")]
    pub trigger_alert: bool,
    #[serde(default = "default_true")]
    pub trigger_alert_normal: bool,
    /// How long a new raw state must persist before it is confirmed.
    #[serde(default, with = "duration_secs")]
    pub alert_delay: Duration,
    pub alert_levels: BTreeSet<i64>,
    /// Polling interval of the monitor.
    #[serde(default = "default_interval", with = "duration_secs")]
    pub interval: Duration,
    /// Hard budget of a single check.
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    pub source: SourceConfig,
}

/// Data source of a sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Host reachability through a ping-like command: `<execute> -c<count> <host>`.
    Ping {
        #[serde(default = "default_ping")]
        execute: PathBuf,
        host: String,
        #[serde(default = "default_ping_count")]
        count: u32,
    },
    /// Any command; exit code 0 means normal.
    Execute {
        execute: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Numeric reading compared against a threshold.
    Number {
        reader: ReaderConfig,
        threshold: f64,
        ordering: ThresholdOrdering,
        #[serde(default)]
        unit: String,
        #[serde(default)]
        value_type: ValueType,
        /// Readings below this value are treated as error readings.
        #[serde(default)]
        sane_lowest_value: Option<f64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ReaderConfig {
    /// Runs a command and parses its stdout as a number.
    Command {
        execute: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Reads the latest value a provider collector stored under `key`.
    Store { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOrdering {
    Lt,
    Eq,
    Gt,
}

impl ThresholdOrdering {
    /// True when `value` is on the abnormal side of `threshold`.
    pub fn crossed(self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOrdering::Lt => value < threshold,
            ThresholdOrdering::Eq => value == threshold,
            ThresholdOrdering::Gt => value > threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    #[default]
    Float,
}

/// Subscription part of an alert definition; handler settings live with the alert node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: i64,
    #[serde(default)]
    pub description: String,
    pub alert_levels: BTreeSet<i64>,
}

/// Periodic provider that feeds a `ReadingStore` from a command's `key value` output lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub execute: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub keys: Vec<String>,
    #[serde(default = "default_interval", with = "duration_secs")]
    pub interval: Duration,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default = "default_tolerated_fails")]
    pub max_tolerated_fails: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Identity of a node on the bus. `username` is also its status topic suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub username: String,
    #[serde(default)]
    pub persistent: bool,
}

impl NodeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.username.trim().is_empty() {
            return Err(ConfigError::InvalidNode("username is empty".into()));
        }
        if self.username.contains(['/', '+', '#']) {
            return Err(ConfigError::InvalidNode(format!(
                "username '{}' contains MQTT topic characters",
                self.username
            )));
        }
        Ok(())
    }
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, keep_alive_secs: default_keep_alive() }
    }
}

fn default_trigger_state() -> u8 {
    1
}

fn default_true() -> bool {
    true
}

/// Upper bound for every per-sensor period.
pub const MAX_PERIOD: Duration = Duration::from_secs(7 * 86_400);

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ping() -> PathBuf {
    PathBuf::from("/bin/ping")
}

fn default_ping_count() -> u32 {
    3
}

fn default_tolerated_fails() -> u32 {
    3
}

fn default_keep_alive() -> u64 {
    30
}

impl SensorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger_state > 1 {
            return Err(ConfigError::sensor(self.id, "trigger_state must be 0 or 1"));
        }
        if self.alert_levels.is_empty() {
            return Err(ConfigError::sensor(self.id, "at least one alert level is required"));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::sensor(self.id, "interval must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::sensor(self.id, "timeout must be positive"));
        }
        for (name, value) in [("interval", self.interval), ("timeout", self.timeout), ("alert_delay", self.alert_delay)] {
            if value > MAX_PERIOD {
                let days = MAX_PERIOD.as_secs() / 86_400;
                return Err(ConfigError::sensor(self.id, format!("{name} must not exceed {days} days")));
            }
        }
        match &self.source {
            SourceConfig::Ping { execute, host, count } => {
                if host.trim().is_empty() {
                    return Err(ConfigError::sensor(self.id, "ping host is empty"));
                }
                if *count == 0 {
                    return Err(ConfigError::sensor(self.id, "ping count must be positive"));
                }
                check_command(self.id, execute)
            }
            SourceConfig::Execute { execute, .. } => check_command(self.id, execute),
            SourceConfig::Number { reader, threshold, .. } => {
                if !threshold.is_finite() {
                    return Err(ConfigError::sensor(self.id, "threshold must be a finite number"));
                }
                match reader {
                    ReaderConfig::Command { execute, .. } => check_command(self.id, execute),
                    ReaderConfig::Store { key } if key.is_empty() => {
                        Err(ConfigError::sensor(self.id, "store key is empty"))
                    }
                    ReaderConfig::Store { .. } => Ok(()),
                }
            }
        }
    }
}

fn check_command(id: i64, execute: &std::path::Path) -> Result<(), ConfigError> {
    if execute.as_os_str().is_empty() {
        return Err(ConfigError::sensor(id, "command path is empty"));
    }
    Ok(())
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alert_levels.is_empty() {
            return Err(ConfigError::alert(self.id, "at least one alert level is required"));
        }
        Ok(())
    }
}

/// Validates every sensor and rejects duplicate ids.
pub fn validate_sensors(sensors: &[SensorConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for sensor in sensors {
        if !seen.insert(sensor.id) {
            return Err(ConfigError::DuplicateSensor(sensor.id));
        }
        sensor.validate()?;
    }
    Ok(())
}

/// Validates every alert and rejects duplicate ids.
pub fn validate_alerts<'a>(alerts: impl IntoIterator<Item = &'a AlertConfig>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for alert in alerts {
        if !seen.insert(alert.id) {
            return Err(ConfigError::DuplicateAlert(alert.id));
        }
        alert.validate()?;
    }
    Ok(())
}

/// (De)serializes a `Duration` as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ping_sensor(id: i64) -> SensorConfig {
        serde_json::from_value(json!({
            "id": id,
            "alert_levels": [1],
            "source": { "kind": "ping", "host": "localhost" }
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let sensor = ping_sensor(1);
        assert_eq!(sensor.trigger_state, 1);
        assert!(sensor.trigger_alert && sensor.trigger_alert_normal);
        assert_eq!(sensor.alert_delay, Duration::ZERO);
        assert_eq!(sensor.interval, Duration::from_secs(60));
        match &sensor.source {
            SourceConfig::Ping { execute, count, .. } => {
                assert_eq!(*execute, PathBuf::from("/bin/ping"));
                assert_eq!(*count, 3);
            }
            other => panic!("unexpected source {other:?}"),
        }
        assert!(sensor.validate().is_ok());
    }

    #[test]
    fn test_fractional_durations() {
        let sensor: SensorConfig = serde_json::from_value(json!({
            "id": 2,
            "alert_levels": [1],
            "alert_delay": 0.25,
            "interval": 1.5,
            "source": { "kind": "execute", "execute": "/bin/true" }
        }))
        .unwrap();
        assert_eq!(sensor.alert_delay, Duration::from_millis(250));
        assert_eq!(sensor.interval, Duration::from_millis(1500));
        assert!(serde_json::from_value::<SensorConfig>(json!({
            "id": 3, "alert_levels": [1], "interval": -1.0,
            "source": { "kind": "execute", "execute": "/bin/true" }
        }))
        .is_err());
    }

    #[test]
    fn test_invalid_definitions_are_rejected() {
        let mut bad_levels = ping_sensor(1);
        bad_levels.alert_levels.clear();
        assert!(matches!(bad_levels.validate(), Err(ConfigError::InvalidSensor { id: 1, .. })));

        let mut bad_trigger = ping_sensor(2);
        bad_trigger.trigger_state = 2;
        assert!(bad_trigger.validate().is_err());

        let mut endless = ping_sensor(4);
        endless.interval = Duration::from_secs(u64::MAX);
        assert!(matches!(endless.validate(), Err(ConfigError::InvalidSensor { id: 4, .. })));
        endless.interval = Duration::from_secs(60);
        endless.alert_delay = MAX_PERIOD + Duration::from_secs(1);
        assert!(endless.validate().is_err());

        let duplicate = vec![ping_sensor(3), ping_sensor(3)];
        assert!(matches!(validate_sensors(&duplicate), Err(ConfigError::DuplicateSensor(3))));

        let alert = AlertConfig { id: 1, description: String::new(), alert_levels: BTreeSet::new() };
        assert!(validate_alerts([&alert]).is_err());
    }

    #[test]
    fn test_node_username() {
        let node = NodeSettings { username: "hall-pi".into(), persistent: true };
        assert!(node.validate().is_ok());
        let node = NodeSettings { username: "hall/pi".into(), persistent: false };
        assert!(matches!(node.validate(), Err(ConfigError::InvalidNode(_))));
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(ThresholdOrdering::Gt.crossed(30.0, 25.0));
        assert!(!ThresholdOrdering::Gt.crossed(25.0, 25.0));
        assert!(ThresholdOrdering::Lt.crossed(-5.0, 0.0));
        assert!(ThresholdOrdering::Eq.crossed(1.0, 1.0));
    }
}
