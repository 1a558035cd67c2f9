//! Persistent system model kept by the server.
//!
//! Node-local ids (`client_sensor_id`, `client_alert_id`) are only unique per
//! node; the storage hands out server-wide ids for every record.

mod memory;

pub use memory::MemoryStorage;

use crate::config::duration_secs;
use crate::error::StorageError;
use crate::model::{SensorData, SensorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Option type holding the active profile id.
pub const PROFILE_OPTION: &str = "profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Sensor,
    Alert,
    Manager,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Sensor => "sensor",
            NodeType::Alert => "alert",
            NodeType::Manager => "manager",
        };
        f.write_str(name)
    }
}

/// What a node announces about itself when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub username: String,
    pub hostname: String,
    pub node_type: NodeType,
    pub instance: String,
    pub version: String,
    /// Persistent nodes are expected to stay connected; losing them is alarming.
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub client_sensor_id: i64,
    pub description: String,
    #[serde(with = "duration_secs")]
    pub alert_delay: Duration,
    pub alert_levels: BTreeSet<i64>,
    pub state: SensorState,
    #[serde(default)]
    pub data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDescriptor {
    pub client_alert_id: i64,
    pub description: String,
    pub alert_levels: BTreeSet<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerDescriptor {
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    pub username: String,
    pub hostname: String,
    pub node_type: NodeType,
    pub instance: String,
    pub version: String,
    pub persistent: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub id: i64,
    pub node_id: i64,
    pub client_sensor_id: i64,
    pub description: String,
    #[serde(with = "duration_secs")]
    pub alert_delay: Duration,
    pub alert_levels: BTreeSet<i64>,
    pub state: SensorState,
    pub data: SensorData,
    pub last_state_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInfo {
    pub id: i64,
    pub node_id: i64,
    pub client_alert_id: i64,
    pub description: String,
    pub alert_levels: BTreeSet<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub id: i64,
    pub node_id: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionRecord {
    pub option_type: String,
    pub value: i64,
}

/// Everything the storage knows, as one consistent copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub options: Vec<OptionRecord>,
    pub nodes: Vec<NodeInfo>,
    pub sensors: Vec<SensorInfo>,
    pub alerts: Vec<AlertInfo>,
    pub managers: Vec<ManagerInfo>,
}

/// Storage backend contract. Lookups return `None` on a miss.
pub trait Storage: Send + Sync {
    /// Inserts or updates a node keyed by username and returns its id.
    fn add_node(&self, node: &NodeDescriptor) -> Result<i64, StorageError>;

    /// Replaces the sensor list of a sensor node. Sensors missing from `sensors` are removed.
    fn add_sensors(&self, username: &str, sensors: &[SensorDescriptor]) -> Result<(), StorageError>;

    /// Replaces the alert list of an alert node. Alerts missing from `alerts` are removed.
    fn add_alerts(&self, username: &str, alerts: &[AlertDescriptor]) -> Result<(), StorageError>;

    fn add_manager(&self, username: &str, manager: &ManagerDescriptor) -> Result<(), StorageError>;

    fn get_node_id(&self, username: &str) -> Option<i64>;

    fn get_sensor_id(&self, node_id: i64, client_sensor_id: i64) -> Option<i64>;

    fn get_alert_id(&self, node_id: i64, client_alert_id: i64) -> Option<i64>;

    fn get_node_by_id(&self, node_id: i64) -> Option<NodeInfo>;

    fn get_sensor_by_id(&self, sensor_id: i64) -> Option<SensorInfo>;

    fn get_alert_by_id(&self, alert_id: i64) -> Option<AlertInfo>;

    fn get_manager_by_id(&self, manager_id: i64) -> Option<ManagerInfo>;

    /// Updates states by node-local sensor id. Nothing is written if any id is unknown.
    fn update_sensor_states(&self, node_id: i64, states: &[(i64, SensorState)]) -> Result<(), StorageError>;

    fn update_sensor_data(&self, node_id: i64, data: &[(i64, SensorData)]) -> Result<(), StorageError>;

    fn get_sensors_updated_older_than(&self, cutoff: DateTime<Utc>) -> Vec<SensorInfo>;

    fn get_sensor_alert_levels(&self, sensor_id: i64) -> Option<BTreeSet<i64>>;

    fn get_alert_alert_levels(&self, alert_id: i64) -> Option<BTreeSet<i64>>;

    fn get_all_sensors_alert_levels(&self) -> BTreeSet<i64>;

    fn get_all_alerts_alert_levels(&self) -> BTreeSet<i64>;

    fn mark_node_connected(&self, node_id: i64, connected: bool) -> Result<(), StorageError>;

    fn get_all_connected_node_ids(&self) -> Vec<i64>;

    fn get_all_persistent_node_ids(&self) -> Vec<i64>;

    fn get_option_by_type(&self, option_type: &str) -> Option<OptionRecord>;

    fn get_options(&self) -> Vec<OptionRecord>;

    fn update_option(&self, option_type: &str, value: i64) -> Result<(), StorageError>;

    /// Returns whether the option existed.
    fn delete_option(&self, option_type: &str) -> Result<bool, StorageError>;

    fn get_system_snapshot(&self) -> SystemSnapshot;
}
