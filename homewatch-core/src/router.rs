//! Alert-level routing.
//!
//! Every alert subscribes to a set of alert levels. A `SensorAlert` reaches
//! the alerts whose levels intersect its own, and each alert is told about a
//! state at most once until the state flips back. `StateChange` events only
//! refresh the shared system state.

use crate::alert::AlertHandler;
use crate::config::AlertConfig;
use crate::error::{AlertError, ConfigError};
use crate::event::{Event, SensorAlert};
use crate::model::{Profile, SensorData, SensorState};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Origin used for events produced on this node.
pub const LOCAL_ORIGIN: &str = "local";

/// Last known state of one sensor as seen by the router.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorRecord {
    pub origin: String,
    pub sensor_id: i64,
    pub state: SensorState,
    pub data: SensorData,
    pub last_update: DateTime<Utc>,
}

/// Shared view of every sensor the router has heard about.
#[derive(Debug, Default)]
pub struct SystemState {
    records: RwLock<BTreeMap<(String, i64), SensorRecord>>,
}

impl SystemState {
    fn apply(&self, origin: &str, event: &Event) {
        let mut records = self.records.write();
        let record = records
            .entry((origin.to_string(), event.sensor_id()))
            .or_insert_with(|| SensorRecord {
                origin: origin.to_string(),
                sensor_id: event.sensor_id(),
                state: event.state(),
                data: SensorData::None,
                last_update: event.timestamp(),
            });
        record.state = event.state();
        record.last_update = event.timestamp();
        if let Event::StateChange(change) = event {
            record.data = change.data.clone();
        }
    }

    pub fn get(&self, origin: &str, sensor_id: i64) -> Option<SensorRecord> {
        self.records.read().get(&(origin.to_string(), sensor_id)).cloned()
    }

    pub fn snapshot(&self) -> Vec<SensorRecord> {
        self.records.read().values().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStatus {
    pub id: i64,
    pub description: String,
    pub state: SensorState,
    pub enabled: bool,
}

#[derive(Debug)]
pub struct DispatchFailure {
    pub alert_id: i64,
    pub callback: &'static str,
    pub error: AlertError,
}

/// Outcome of one dispatch: which alerts were invoked and which of them failed.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub invoked: Vec<i64>,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct AlertSlot {
    config: AlertConfig,
    handler: Arc<dyn AlertHandler>,
    state: SensorState,
    enabled: bool,
}

pub struct AlertLevelRouter {
    slots: Mutex<Vec<AlertSlot>>,
    system: SystemState,
    profile: RwLock<Option<Profile>>,
}

impl AlertLevelRouter {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            system: SystemState::default(),
            profile: RwLock::new(None),
        }
    }

    pub fn register(&mut self, config: AlertConfig, handler: Arc<dyn AlertHandler>) -> Result<(), ConfigError> {
        config.validate()?;
        let slots = self.slots.get_mut();
        if slots.iter().any(|slot| slot.config.id == config.id) {
            return Err(ConfigError::DuplicateAlert(config.id));
        }
        slots.push(AlertSlot { config, handler, state: SensorState::Normal, enabled: true });
        Ok(())
    }

    /// Initializes every handler; the ones that refuse (or panic) are disabled.
    pub async fn initialize_all(&self) {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter_mut() {
            let ready = AssertUnwindSafe(slot.handler.initialize()).catch_unwind().await.unwrap_or(false);
            slot.enabled = ready;
            if ready {
                info!(alert = slot.config.id, description = %slot.config.description, "alert initialized");
            } else {
                error!(alert = slot.config.id, description = %slot.config.description, "alert failed to initialize, disabled");
            }
        }
    }

    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        self.dispatch_from(LOCAL_ORIGIN, event).await
    }

    pub async fn dispatch_from(&self, origin: &str, event: &Event) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut slots = self.slots.lock().await;
        self.system.apply(origin, event);

        let Event::SensorAlert(alert) = event else {
            return report;
        };

        for slot in slots.iter_mut().filter(|slot| slot.enabled) {
            if slot.config.alert_levels.is_disjoint(&alert.alert_levels) {
                continue;
            }
            if slot.state == alert.state {
                debug!(alert = slot.config.id, sensor = alert.sensor_id, state = %alert.state, "alert already in state");
                continue;
            }

            let (callback, result) = match alert.state {
                SensorState::Triggered => ("alert_triggered", guarded(slot.handler.alert_triggered(alert)).await),
                SensorState::Normal => ("alert_normal", guarded(slot.handler.alert_normal(alert)).await),
            };
            slot.state = alert.state;
            report.invoked.push(slot.config.id);
            record_result(&mut report, slot.config.id, callback, alert, result);
        }
        report
    }

    /// Tells every enabled alert about a new system profile.
    pub async fn profile_change(&self, profile: &Profile) -> DispatchReport {
        let mut report = DispatchReport::default();
        let slots = self.slots.lock().await;
        *self.profile.write() = Some(profile.clone());
        info!(profile = profile.id, name = %profile.name, "system profile changed");

        for slot in slots.iter().filter(|slot| slot.enabled) {
            report.invoked.push(slot.config.id);
            if let Err(error) = guarded(slot.handler.alert_profile_change(profile)).await {
                warn!(alert = slot.config.id, %error, "alert_profile_change failed");
                report.failures.push(DispatchFailure { alert_id: slot.config.id, callback: "alert_profile_change", error });
            }
        }
        report
    }

    pub async fn alert_states(&self) -> Vec<AlertStatus> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|slot| AlertStatus {
                id: slot.config.id,
                description: slot.config.description.clone(),
                state: slot.state,
                enabled: slot.enabled,
            })
            .collect()
    }

    pub fn system_state(&self) -> &SystemState {
        &self.system
    }

    pub fn current_profile(&self) -> Option<Profile> {
        self.profile.read().clone()
    }
}

impl Default for AlertLevelRouter {
    fn default() -> Self {
        Self::new()
    }
}

async fn guarded<F>(callback: F) -> Result<(), AlertError>
where
    F: Future<Output = Result<(), AlertError>>,
{
    AssertUnwindSafe(callback).catch_unwind().await.unwrap_or(Err(AlertError::Panicked))
}

fn record_result(
    report: &mut DispatchReport,
    alert_id: i64,
    callback: &'static str,
    alert: &SensorAlert,
    result: Result<(), AlertError>,
) {
    match result {
        Ok(()) => debug!(alert = alert_id, sensor = alert.sensor_id, callback, "alert delivered"),
        Err(error) => {
            warn!(alert = alert_id, sensor = alert.sensor_id, callback, %error, "alert callback failed");
            report.failures.push(DispatchFailure { alert_id, callback, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StateChange;
    use crate::model::OptionalData;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        triggered: AtomicUsize,
        normal: AtomicUsize,
        profile: AtomicUsize,
    }

    #[async_trait]
    impl AlertHandler for Counting {
        async fn initialize(&self) -> bool {
            true
        }

        async fn alert_triggered(&self, _alert: &SensorAlert) -> Result<(), AlertError> {
            self.triggered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn alert_normal(&self, _alert: &SensorAlert) -> Result<(), AlertError> {
            self.normal.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn alert_profile_change(&self, _profile: &Profile) -> Result<(), AlertError> {
            self.profile.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    enum Broken {
        Failing,
        Panicking,
        Refusing,
    }

    #[async_trait]
    impl AlertHandler for Broken {
        async fn initialize(&self) -> bool {
            !matches!(self, Broken::Refusing)
        }

        async fn alert_triggered(&self, _alert: &SensorAlert) -> Result<(), AlertError> {
            match self {
                Broken::Panicking => panic!("siren exploded"),
                _ => Err(AlertError::Command("exit status 1".into())),
            }
        }

        async fn alert_normal(&self, _alert: &SensorAlert) -> Result<(), AlertError> {
            Ok(())
        }

        async fn alert_profile_change(&self, _profile: &Profile) -> Result<(), AlertError> {
            Err(AlertError::Other("offline".into()))
        }
    }

    fn alert_config(id: i64, levels: &[i64]) -> AlertConfig {
        AlertConfig { id, description: format!("alert {id}"), alert_levels: levels.iter().copied().collect() }
    }

    fn sensor_alert(state: SensorState, levels: &[i64]) -> Event {
        SensorAlert::new(3, state, levels.iter().copied().collect::<BTreeSet<_>>(), OptionalData::new()).into()
    }

    #[tokio::test]
    async fn test_trigger_is_delivered_once() {
        let counting = Arc::new(Counting::default());
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), counting.clone()).unwrap();
        router.initialize_all().await;

        let report = router.dispatch(&sensor_alert(SensorState::Triggered, &[1])).await;
        assert_eq!(report.invoked, vec![1]);
        let replay = router.dispatch(&sensor_alert(SensorState::Triggered, &[1])).await;
        assert!(replay.invoked.is_empty());
        assert_eq!(counting.triggered.load(Ordering::SeqCst), 1);

        router.dispatch(&sensor_alert(SensorState::Normal, &[1])).await;
        router.dispatch(&sensor_alert(SensorState::Normal, &[1])).await;
        assert_eq!(counting.normal.load(Ordering::SeqCst), 1);
        assert_eq!(router.alert_states().await[0].state, SensorState::Normal);
    }

    #[tokio::test]
    async fn test_levels_must_intersect() {
        let level_one = Arc::new(Counting::default());
        let level_two = Arc::new(Counting::default());
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), level_one.clone()).unwrap();
        router.register(alert_config(2, &[2, 5]), level_two.clone()).unwrap();
        router.initialize_all().await;

        let report = router.dispatch(&sensor_alert(SensorState::Triggered, &[5, 9])).await;
        assert_eq!(report.invoked, vec![2]);
        assert_eq!(level_one.triggered.load(Ordering::SeqCst), 0);
        assert_eq!(level_two.triggered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_change_updates_system_state_only() {
        let counting = Arc::new(Counting::default());
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), counting.clone()).unwrap();

        let data = SensorData::Float { value: 4.2, unit: "bar".into() };
        let change: Event = StateChange::new(3, SensorState::Triggered, data.clone()).into();
        let report = router.dispatch_from("cellar", &change).await;
        assert!(report.invoked.is_empty());
        assert_eq!(counting.triggered.load(Ordering::SeqCst), 0);

        let record = router.system_state().get("cellar", 3).unwrap();
        assert_eq!(record.state, SensorState::Triggered);
        assert_eq!(record.data, data);

        router.dispatch_from("cellar", &sensor_alert(SensorState::Normal, &[7])).await;
        let record = router.system_state().get("cellar", 3).unwrap();
        assert_eq!(record.state, SensorState::Normal);
        assert_eq!(record.data, data);
        assert!(router.system_state().get(LOCAL_ORIGIN, 3).is_none());
    }

    #[tokio::test]
    async fn test_profile_change_reaches_every_enabled_alert() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), first.clone()).unwrap();
        router.register(alert_config(2, &[99]), second.clone()).unwrap();
        router.register(alert_config(3, &[1]), Arc::new(Broken::Refusing)).unwrap();
        router.initialize_all().await;

        let profile = Profile { id: 2, name: "away".into() };
        let report = router.profile_change(&profile).await;
        assert_eq!(report.invoked, vec![1, 2]);
        assert_eq!(first.profile.load(Ordering::SeqCst), 1);
        assert_eq!(second.profile.load(Ordering::SeqCst), 1);
        assert_eq!(router.current_profile(), Some(profile));
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let counting = Arc::new(Counting::default());
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), Arc::new(Broken::Failing)).unwrap();
        router.register(alert_config(2, &[1]), Arc::new(Broken::Panicking)).unwrap();
        router.register(alert_config(3, &[1]), counting.clone()).unwrap();
        router.initialize_all().await;

        let report = router.dispatch(&sensor_alert(SensorState::Triggered, &[1])).await;
        assert_eq!(report.invoked, vec![1, 2, 3]);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[1].error, AlertError::Panicked));
        assert_eq!(counting.triggered.load(Ordering::SeqCst), 1);

        let states = router.alert_states().await;
        assert!(states.iter().all(|status| status.state == SensorState::Triggered));
        let replay = router.dispatch(&sensor_alert(SensorState::Triggered, &[1])).await;
        assert!(replay.is_clean());
        assert!(replay.invoked.is_empty());
    }

    #[test]
    fn test_duplicate_alert_rejected() {
        let mut router = AlertLevelRouter::new();
        router.register(alert_config(1, &[1]), Arc::new(Counting::default())).unwrap();
        let err = router.register(alert_config(1, &[2]), Arc::new(Counting::default())).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAlert(1)));
    }
}
