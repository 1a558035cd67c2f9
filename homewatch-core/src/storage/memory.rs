use super::{
    AlertDescriptor, AlertInfo, ManagerDescriptor, ManagerInfo, NodeDescriptor, NodeInfo, NodeType, OptionRecord,
    SensorDescriptor, SensorInfo, Storage, SystemSnapshot, PROFILE_OPTION,
};
use crate::error::StorageError;
use crate::model::{SensorData, SensorState};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tables {
    next_id: i64,
    options: BTreeMap<String, OptionRecord>,
    nodes: BTreeMap<i64, NodeInfo>,
    sensors: BTreeMap<i64, SensorInfo>,
    alerts: BTreeMap<i64, AlertInfo>,
    managers: BTreeMap<i64, ManagerInfo>,
}

impl Default for Tables {
    fn default() -> Self {
        let mut options = BTreeMap::new();
        options.insert(PROFILE_OPTION.to_string(), OptionRecord { option_type: PROFILE_OPTION.to_string(), value: 0 });
        Self {
            next_id: 1,
            options,
            nodes: BTreeMap::new(),
            sensors: BTreeMap::new(),
            alerts: BTreeMap::new(),
            managers: BTreeMap::new(),
        }
    }
}

impl Tables {
    fn allocate(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn node_by_username(&self, username: &str) -> Option<&NodeInfo> {
        self.nodes.values().find(|node| node.username == username)
    }

    fn node_of_type(&self, username: &str, expected: NodeType) -> Result<i64, StorageError> {
        let node = self
            .node_by_username(username)
            .ok_or_else(|| StorageError::UnknownUsername(username.to_string()))?;
        if node.node_type != expected {
            return Err(StorageError::NodeTypeMismatch {
                username: username.to_string(),
                stored: node.node_type.to_string(),
                got: expected.to_string(),
            });
        }
        Ok(node.id)
    }

    fn sensor_id(&self, node_id: i64, client_sensor_id: i64) -> Option<i64> {
        self.sensors
            .values()
            .find(|s| s.node_id == node_id && s.client_sensor_id == client_sensor_id)
            .map(|s| s.id)
    }

    fn alert_id(&self, node_id: i64, client_alert_id: i64) -> Option<i64> {
        self.alerts
            .values()
            .find(|a| a.node_id == node_id && a.client_alert_id == client_alert_id)
            .map(|a| a.id)
    }

    /// Resolves every client id first so a bad batch writes nothing.
    fn resolve_sensors(&self, node_id: i64, client_ids: impl Iterator<Item = i64>) -> Result<Vec<i64>, StorageError> {
        if !self.nodes.contains_key(&node_id) {
            return Err(StorageError::UnknownNode(node_id));
        }
        client_ids
            .map(|client_id| {
                self.sensor_id(node_id, client_id)
                    .ok_or(StorageError::UnknownSensor { node_id, client_id })
            })
            .collect()
    }
}

/// In-memory storage with optional JSON persistence.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the JSON snapshot at `path` if it exists. Every node starts disconnected.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if !tokio::fs::try_exists(&path).await? {
            info!(path = %path.display(), "no existing storage file, starting fresh");
            return Ok(Self { tables: RwLock::new(Tables::default()), path: Some(path) });
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut tables: Tables = serde_json::from_str(&content)?;
        for node in tables.nodes.values_mut() {
            node.connected = false;
        }
        info!(path = %path.display(), nodes = tables.nodes.len(), sensors = tables.sensors.len(), "storage loaded");
        Ok(Self { tables: RwLock::new(tables), path: Some(path) })
    }

    /// Writes the JSON snapshot. A storage without a path keeps everything in memory.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = {
            let tables = self.tables.read();
            serde_json::to_string_pretty(&*tables)?
        };
        tokio::fs::write(path, content).await?;
        debug!(path = %path.display(), "storage persisted");
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn add_node(&self, node: &NodeDescriptor) -> Result<i64, StorageError> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.node_by_username(&node.username) {
            if existing.node_type != node.node_type {
                return Err(StorageError::NodeTypeMismatch {
                    username: node.username.clone(),
                    stored: existing.node_type.to_string(),
                    got: node.node_type.to_string(),
                });
            }
            let id = existing.id;
            if let Some(stored) = tables.nodes.get_mut(&id) {
                stored.hostname = node.hostname.clone();
                stored.instance = node.instance.clone();
                stored.version = node.version.clone();
                stored.persistent = node.persistent;
            }
            return Ok(id);
        }

        let id = tables.allocate();
        tables.nodes.insert(
            id,
            NodeInfo {
                id,
                username: node.username.clone(),
                hostname: node.hostname.clone(),
                node_type: node.node_type,
                instance: node.instance.clone(),
                version: node.version.clone(),
                persistent: node.persistent,
                connected: false,
            },
        );
        info!(node = id, username = %node.username, node_type = %node.node_type, "node added");
        Ok(id)
    }

    fn add_sensors(&self, username: &str, sensors: &[SensorDescriptor]) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let node_id = tables.node_of_type(username, NodeType::Sensor)?;
        let now = Utc::now();

        let keep: BTreeSet<i64> = sensors.iter().map(|s| s.client_sensor_id).collect();
        tables.sensors.retain(|_, s| s.node_id != node_id || keep.contains(&s.client_sensor_id));

        for sensor in sensors {
            let id = match tables.sensor_id(node_id, sensor.client_sensor_id) {
                Some(id) => id,
                None => tables.allocate(),
            };
            tables.sensors.insert(
                id,
                SensorInfo {
                    id,
                    node_id,
                    client_sensor_id: sensor.client_sensor_id,
                    description: sensor.description.clone(),
                    alert_delay: sensor.alert_delay,
                    alert_levels: sensor.alert_levels.clone(),
                    state: sensor.state,
                    data: sensor.data.clone(),
                    last_state_update: now,
                },
            );
        }
        debug!(node = node_id, count = sensors.len(), "sensors stored");
        Ok(())
    }

    fn add_alerts(&self, username: &str, alerts: &[AlertDescriptor]) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let node_id = tables.node_of_type(username, NodeType::Alert)?;

        let keep: BTreeSet<i64> = alerts.iter().map(|a| a.client_alert_id).collect();
        tables.alerts.retain(|_, a| a.node_id != node_id || keep.contains(&a.client_alert_id));

        for alert in alerts {
            let id = match tables.alert_id(node_id, alert.client_alert_id) {
                Some(id) => id,
                None => tables.allocate(),
            };
            tables.alerts.insert(
                id,
                AlertInfo {
                    id,
                    node_id,
                    client_alert_id: alert.client_alert_id,
                    description: alert.description.clone(),
                    alert_levels: alert.alert_levels.clone(),
                },
            );
        }
        debug!(node = node_id, count = alerts.len(), "alerts stored");
        Ok(())
    }

    fn add_manager(&self, username: &str, manager: &ManagerDescriptor) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let node_id = tables.node_of_type(username, NodeType::Manager)?;
        let existing = tables.managers.values().find(|m| m.node_id == node_id).map(|m| m.id);
        let id = match existing {
            Some(id) => id,
            None => tables.allocate(),
        };
        tables.managers.insert(id, ManagerInfo { id, node_id, description: manager.description.clone() });
        Ok(())
    }

    fn get_node_id(&self, username: &str) -> Option<i64> {
        self.tables.read().node_by_username(username).map(|n| n.id)
    }

    fn get_sensor_id(&self, node_id: i64, client_sensor_id: i64) -> Option<i64> {
        self.tables.read().sensor_id(node_id, client_sensor_id)
    }

    fn get_alert_id(&self, node_id: i64, client_alert_id: i64) -> Option<i64> {
        self.tables.read().alert_id(node_id, client_alert_id)
    }

    fn get_node_by_id(&self, node_id: i64) -> Option<NodeInfo> {
        self.tables.read().nodes.get(&node_id).cloned()
    }

    fn get_sensor_by_id(&self, sensor_id: i64) -> Option<SensorInfo> {
        self.tables.read().sensors.get(&sensor_id).cloned()
    }

    fn get_alert_by_id(&self, alert_id: i64) -> Option<AlertInfo> {
        self.tables.read().alerts.get(&alert_id).cloned()
    }

    fn get_manager_by_id(&self, manager_id: i64) -> Option<ManagerInfo> {
        self.tables.read().managers.get(&manager_id).cloned()
    }

    fn update_sensor_states(&self, node_id: i64, states: &[(i64, SensorState)]) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let ids = tables.resolve_sensors(node_id, states.iter().map(|(client_id, _)| *client_id))?;
        let now = Utc::now();
        for (id, (_, state)) in ids.into_iter().zip(states) {
            if let Some(sensor) = tables.sensors.get_mut(&id) {
                sensor.state = *state;
                sensor.last_state_update = now;
            }
        }
        Ok(())
    }

    fn update_sensor_data(&self, node_id: i64, data: &[(i64, SensorData)]) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let ids = tables.resolve_sensors(node_id, data.iter().map(|(client_id, _)| *client_id))?;
        let now = Utc::now();
        for (id, (_, value)) in ids.into_iter().zip(data) {
            if let Some(sensor) = tables.sensors.get_mut(&id) {
                sensor.data = value.clone();
                sensor.last_state_update = now;
            }
        }
        Ok(())
    }

    fn get_sensors_updated_older_than(&self, cutoff: DateTime<Utc>) -> Vec<SensorInfo> {
        self.tables
            .read()
            .sensors
            .values()
            .filter(|s| s.last_state_update < cutoff)
            .cloned()
            .collect()
    }

    fn get_sensor_alert_levels(&self, sensor_id: i64) -> Option<BTreeSet<i64>> {
        self.tables.read().sensors.get(&sensor_id).map(|s| s.alert_levels.clone())
    }

    fn get_alert_alert_levels(&self, alert_id: i64) -> Option<BTreeSet<i64>> {
        self.tables.read().alerts.get(&alert_id).map(|a| a.alert_levels.clone())
    }

    fn get_all_sensors_alert_levels(&self) -> BTreeSet<i64> {
        self.tables
            .read()
            .sensors
            .values()
            .flat_map(|s| s.alert_levels.iter().copied())
            .collect()
    }

    fn get_all_alerts_alert_levels(&self) -> BTreeSet<i64> {
        self.tables
            .read()
            .alerts
            .values()
            .flat_map(|a| a.alert_levels.iter().copied())
            .collect()
    }

    fn mark_node_connected(&self, node_id: i64, connected: bool) -> Result<(), StorageError> {
        let mut tables = self.tables.write();
        let node = tables.nodes.get_mut(&node_id).ok_or(StorageError::UnknownNode(node_id))?;
        if node.connected != connected {
            info!(node = node_id, username = %node.username, connected, "node connection changed");
        }
        node.connected = connected;
        Ok(())
    }

    fn get_all_connected_node_ids(&self) -> Vec<i64> {
        self.tables.read().nodes.values().filter(|n| n.connected).map(|n| n.id).collect()
    }

    fn get_all_persistent_node_ids(&self) -> Vec<i64> {
        self.tables.read().nodes.values().filter(|n| n.persistent).map(|n| n.id).collect()
    }

    fn get_option_by_type(&self, option_type: &str) -> Option<OptionRecord> {
        self.tables.read().options.get(option_type).cloned()
    }

    fn get_options(&self) -> Vec<OptionRecord> {
        self.tables.read().options.values().cloned().collect()
    }

    fn update_option(&self, option_type: &str, value: i64) -> Result<(), StorageError> {
        self.tables.write().options.insert(
            option_type.to_string(),
            OptionRecord { option_type: option_type.to_string(), value },
        );
        Ok(())
    }

    fn delete_option(&self, option_type: &str) -> Result<bool, StorageError> {
        Ok(self.tables.write().options.remove(option_type).is_some())
    }

    fn get_system_snapshot(&self) -> SystemSnapshot {
        let tables = self.tables.read();
        SystemSnapshot {
            options: tables.options.values().cloned().collect(),
            nodes: tables.nodes.values().cloned().collect(),
            sensors: tables.sensors.values().cloned().collect(),
            alerts: tables.alerts.values().cloned().collect(),
            managers: tables.managers.values().cloned().collect(),
        }
    }
}
