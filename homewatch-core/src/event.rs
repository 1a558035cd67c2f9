//! Events emitted by sensor monitors.
//!
//! An event is created once by its monitor and never mutated afterwards.

use crate::model::{OptionalData, SensorData, SensorState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Transition that demands alert dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAlert {
    pub sensor_id: i64,
    pub state: SensorState,
    pub alert_levels: BTreeSet<i64>,
    pub has_optional_data: bool,
    pub optional_data: OptionalData,
    pub timestamp: DateTime<Utc>,
}

impl SensorAlert {
    pub fn new(
        sensor_id: i64,
        state: SensorState,
        alert_levels: BTreeSet<i64>,
        optional_data: OptionalData,
    ) -> Self {
        Self {
            sensor_id,
            state,
            alert_levels,
            has_optional_data: !optional_data.is_empty(),
            optional_data,
            timestamp: Utc::now(),
        }
    }

    /// Convenience accessor for `optional_data.reason`.
    pub fn reason(&self) -> Option<&str> {
        self.optional_data.get("reason").and_then(|v| v.as_str())
    }
}

/// Informational transition: updates shared state, never dispatched to alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub sensor_id: i64,
    pub state: SensorState,
    pub data: SensorData,
    pub timestamp: DateTime<Utc>,
}

impl StateChange {
    pub fn new(sensor_id: i64, state: SensorState, data: SensorData) -> Self {
        Self { sensor_id, state, data, timestamp: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    SensorAlert(SensorAlert),
    StateChange(StateChange),
}

impl Event {
    pub fn sensor_id(&self) -> i64 {
        match self {
            Event::SensorAlert(alert) => alert.sensor_id,
            Event::StateChange(change) => change.sensor_id,
        }
    }

    pub fn state(&self) -> SensorState {
        match self {
            Event::SensorAlert(alert) => alert.state,
            Event::StateChange(change) => change.state,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::SensorAlert(alert) => alert.timestamp,
            Event::StateChange(change) => change.timestamp,
        }
    }

    pub fn as_sensor_alert(&self) -> Option<&SensorAlert> {
        match self {
            Event::SensorAlert(alert) => Some(alert),
            Event::StateChange(_) => None,
        }
    }

    pub fn as_state_change(&self) -> Option<&StateChange> {
        match self {
            Event::StateChange(change) => Some(change),
            Event::SensorAlert(_) => None,
        }
    }
}

impl From<SensorAlert> for Event {
    fn from(alert: SensorAlert) -> Self {
        Event::SensorAlert(alert)
    }
}

impl From<StateChange> for Event {
    fn from(change: StateChange) -> Self {
        Event::StateChange(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_optional_data_flag() {
        let mut data = OptionalData::new();
        let empty = SensorAlert::new(1, SensorState::Triggered, BTreeSet::from([1]), data.clone());
        assert!(!empty.has_optional_data);
        assert_eq!(empty.reason(), None);

        data.insert("reason".into(), json!("processtimeout"));
        let alert = SensorAlert::new(1, SensorState::Triggered, BTreeSet::from([1]), data);
        assert!(alert.has_optional_data);
        assert_eq!(alert.reason(), Some("processtimeout"));
    }

    #[test]
    fn test_event_is_tagged() {
        let event: Event = StateChange::new(7, SensorState::Normal, SensorData::None).into();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "state_change");
        assert_eq!(value["sensor_id"], 7);
        assert_eq!(value["state"], 0);
        assert_eq!(event.sensor_id(), 7);
        assert!(event.as_sensor_alert().is_none());
    }
}
