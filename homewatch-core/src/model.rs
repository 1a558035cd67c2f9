//! Semantic data model shared by every node.
//!
//! - `SensorState` is the canonical binary state (serialized as 0/1)
//! - `SensorData` is the typed value a sensor currently holds
//! - `SensorHandle` owns the mutable per-sensor record; only the monitor writes it,
//!   everybody else reads a `SensorSnapshot` copy

use crate::config::SensorConfig;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Open key/value diagnostics attached to events (e.g. `reason`).
pub type OptionalData = serde_json::Map<String, serde_json::Value>;

/// Canonical sensor/alert state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SensorState {
    #[default]
    Normal = 0,
    Triggered = 1,
}

impl SensorState {
    /// Normalizes a vendor-specific raw value using the sensor's trigger polarity.
    pub fn from_raw(raw: u8, trigger_state: u8) -> Self {
        if raw == trigger_state {
            SensorState::Triggered
        } else {
            SensorState::Normal
        }
    }

    /// Inverse of [`SensorState::from_raw`].
    pub fn to_raw(self, trigger_state: u8) -> u8 {
        match self {
            SensorState::Triggered => trigger_state,
            SensorState::Normal => u8::from(trigger_state == 0),
        }
    }

    pub fn is_triggered(self) -> bool {
        self == SensorState::Triggered
    }
}

impl From<SensorState> for u8 {
    fn from(state: SensorState) -> u8 {
        state as u8
    }
}

impl TryFrom<u8> for SensorState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SensorState::Normal),
            1 => Ok(SensorState::Triggered),
            other => Err(format!("invalid sensor state {other}")),
        }
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorState::Normal => write!(f, "normal"),
            SensorState::Triggered => write!(f, "triggered"),
        }
    }
}

/// Value held by a sensor. Semantics are source-specific.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SensorData {
    #[default]
    None,
    Int { value: i64, unit: String },
    Float { value: f64, unit: String },
}

impl SensorData {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorData::None => None,
            SensorData::Int { value, .. } => Some(*value as f64),
            SensorData::Float { value, .. } => Some(*value),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SensorData::None)
    }
}

/// Operating mode of the whole system (e.g. armed / disarmed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
}

/// Consistent copy of a sensor's runtime record.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub id: i64,
    pub description: String,
    pub state: SensorState,
    pub data: SensorData,
    pub last_state_change: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

/// Shared runtime record of one sensor.
///
/// Written exclusively by the owning `SensorMonitor`; status queries use
/// [`SensorHandle::snapshot`] and never observe a half-applied update.
#[derive(Debug)]
pub struct SensorHandle {
    config: SensorConfig,
    record: RwLock<SensorSnapshot>,
}

impl SensorHandle {
    pub(crate) fn new(config: SensorConfig, state: SensorState, data: SensorData) -> Self {
        let record = SensorSnapshot {
            id: config.id,
            description: config.description.clone(),
            state,
            data,
            last_state_change: None,
            last_update: Utc::now(),
        };
        Self { config, record: RwLock::new(record) }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.record.read().clone()
    }

    pub fn state(&self) -> SensorState {
        self.record.read().state
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: SensorState) {
        let mut record = self.record.write();
        record.state = state;
    }

    /// Applies a confirmed transition together with the data that confirmed it.
    pub(crate) fn apply_transition(&self, state: SensorState, data: Option<SensorData>) {
        let now = Utc::now();
        let mut record = self.record.write();
        record.state = state;
        if let Some(data) = data {
            record.data = data;
        }
        record.last_state_change = Some(now);
        record.last_update = now;
    }

    pub(crate) fn update_data(&self, data: SensorData) {
        let mut record = self.record.write();
        record.data = data;
        record.last_update = Utc::now();
    }
}
