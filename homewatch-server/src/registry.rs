//! Node bookkeeping on top of the storage: registrations, sensor events,
//! connection status and the stale-sensor watchdog.

use anyhow::Result;
use chrono::Utc;
use homewatch_core::storage::NodeType;
use homewatch_core::{
    Event, MemoryStorage, NodeRegistration, SensorDataUpdate, ShutdownSignal, Storage, StorageError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type SharedNodeRegistry = Arc<NodeRegistry>;

pub struct NodeRegistry {
    storage: Arc<MemoryStorage>,
}

impl NodeRegistry {
    pub fn new(storage: Arc<MemoryStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Upserts the node and everything it announced, then marks it connected.
    pub async fn handle_registration(&self, registration: NodeRegistration) -> Result<i64> {
        let node = &registration.node;
        let node_id = self.storage.add_node(node)?;
        match node.node_type {
            NodeType::Sensor => self.storage.add_sensors(&node.username, &registration.sensors)?,
            NodeType::Alert => self.storage.add_alerts(&node.username, &registration.alerts)?,
            NodeType::Manager => {
                if let Some(manager) = &registration.manager {
                    self.storage.add_manager(&node.username, manager)?;
                }
            }
        }
        self.storage.mark_node_connected(node_id, true)?;

        if let Err(e) = self.storage.persist().await {
            error!(error = %e, "failed to persist storage after registration");
        }
        info!(
            node = node_id,
            username = %node.username,
            node_type = %node.node_type,
            sensors = registration.sensors.len(),
            alerts = registration.alerts.len(),
            "node registered"
        );
        Ok(node_id)
    }

    /// Records a sensor event of node `username`.
    pub fn handle_event(&self, username: &str, event: &Event) -> Result<(), StorageError> {
        let node_id = self
            .storage
            .get_node_id(username)
            .ok_or_else(|| StorageError::UnknownUsername(username.to_string()))?;
        self.storage.update_sensor_states(node_id, &[(event.sensor_id(), event.state())])?;
        if let Event::StateChange(change) = event {
            self.storage.update_sensor_data(node_id, &[(change.sensor_id, change.data.clone())])?;
        }
        debug!(node = node_id, sensor = event.sensor_id(), state = %event.state(), "sensor event stored");
        Ok(())
    }

    /// Stores the data refresh of node `username`; states stay untouched.
    pub fn handle_data_update(&self, username: &str, updates: &[SensorDataUpdate]) -> Result<(), StorageError> {
        let node_id = self
            .storage
            .get_node_id(username)
            .ok_or_else(|| StorageError::UnknownUsername(username.to_string()))?;
        let data: Vec<_> = updates.iter().map(|update| (update.sensor_id, update.data.clone())).collect();
        self.storage.update_sensor_data(node_id, &data)?;
        debug!(node = node_id, sensors = data.len(), "sensor data updated");
        Ok(())
    }

    /// Called for the node's `offline` status (clean stop or broker last will).
    pub async fn mark_offline(&self, username: &str) {
        let Some(node_id) = self.storage.get_node_id(username) else {
            debug!(%username, "offline status of unknown node");
            return;
        };
        if let Err(e) = self.storage.mark_node_connected(node_id, false) {
            warn!(%username, error = %e, "failed to mark node offline");
            return;
        }
        if let Some(node) = self.storage.get_node_by_id(node_id) {
            if node.persistent {
                warn!(%username, "persistent node went offline");
            } else {
                info!(%username, "node went offline");
            }
        }
        if let Err(e) = self.storage.persist().await {
            error!(error = %e, "failed to persist storage");
        }
    }

    /// Sensors of connected nodes whose last update is older than `timeout`.
    pub fn stale_sensors(&self, timeout: Duration) -> Vec<homewatch_core::storage::SensorInfo> {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let connected = self.storage.get_all_connected_node_ids();
        self.storage
            .get_sensors_updated_older_than(Utc::now() - timeout)
            .into_iter()
            .filter(|sensor| connected.contains(&sensor.node_id))
            .collect()
    }

    /// Logs stale sensors once a minute until shutdown.
    pub fn start_sensor_monitoring(registry: SharedNodeRegistry, timeout: Duration, shutdown: ShutdownSignal) {
        info!(timeout_secs = timeout.as_secs(), "starting sensor monitoring");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => {
                        for sensor in registry.stale_sensors(timeout) {
                            warn!(
                                sensor = sensor.id,
                                node = sensor.node_id,
                                description = %sensor.description,
                                last_update = %sensor.last_state_update,
                                "sensor timed out"
                            );
                        }
                    }
                }
            }
        });
    }
}
