use crate::state::{new_state, Shared};
use homewatch_core::Storage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerHealth {
    pub uptime_seconds: u64,
    pub nodes_known: u32,
    pub nodes_connected: u32,
    pub sensors_tracked: u32,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_connects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_connects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("connecting".to_string()),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        self.mqtt_connects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn get_health(&self, storage: &dyn Storage) -> ServerHealth {
        let snapshot = storage.get_system_snapshot();
        ServerHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_known: snapshot.nodes.len() as u32,
            nodes_connected: snapshot.nodes.iter().filter(|n| n.connected).count() as u32,
            sensors_tracked: snapshot.sensors.len() as u32,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_connects.load(Ordering::Relaxed).saturating_sub(1),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use homewatch_core::storage::{NodeDescriptor, NodeType};
    use homewatch_core::MemoryStorage;

    #[test]
    fn test_health_counts() {
        let storage = MemoryStorage::new();
        let node = NodeDescriptor {
            username: "hall".into(),
            hostname: "pi".into(),
            node_type: NodeType::Sensor,
            instance: "homewatch-sensor".into(),
            version: "1.0.0".into(),
            persistent: true,
        };
        let id = storage.add_node(&node).unwrap();
        storage.mark_node_connected(id, true).unwrap();

        let tracker = HealthTracker::new();
        assert_eq!(tracker.get_health(&storage).mqtt_status, "connecting");
        tracker.mark_mqtt_connected();
        tracker.mark_mqtt_connected();

        let health = tracker.get_health(&storage);
        assert_eq!(health.nodes_known, 1);
        assert_eq!(health.nodes_connected, 1);
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!(health.mqtt_reconnects, 1);
    }
}
