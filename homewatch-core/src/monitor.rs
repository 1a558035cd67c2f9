//! Per-sensor monitoring loop.
//!
//! One `SensorMonitor` runs as its own task. It samples its source on the
//! configured interval, canonicalizes the result with the sensor's trigger
//! polarity, debounces flips through `alert_delay` and pushes exactly one event
//! per confirmed transition into its queue.

use crate::config::{SensorConfig, MAX_PERIOD};
use crate::error::SensorError;
use crate::event::{Event, SensorAlert, StateChange};
use crate::model::{OptionalData, SensorData, SensorHandle, SensorState};
use crate::queue::EventQueue;
use crate::shutdown::ShutdownSignal;
use crate::source::{Sample, SensorSource};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A flip that was observed but is not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingTransition {
    target: SensorState,
    since: Instant,
}

pub struct SensorMonitor {
    handle: Arc<SensorHandle>,
    source: Box<dyn SensorSource>,
    queue: Arc<EventQueue>,
    shutdown: ShutdownSignal,
    pending: Option<PendingTransition>,
}

impl SensorMonitor {
    /// Validates the definition, prepares the source and takes the first reading.
    pub async fn initialize(
        config: SensorConfig,
        mut source: Box<dyn SensorSource>,
        queue: Arc<EventQueue>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, SensorError> {
        config.validate()?;
        let data = source.initialize(&config).await?;
        info!(sensor = config.id, kind = source.kind(), description = %config.description, "sensor initialized");
        Ok(Self {
            handle: Arc::new(SensorHandle::new(config, SensorState::Normal, data)),
            source,
            queue,
            shutdown,
            pending: None,
        })
    }

    pub fn handle(&self) -> Arc<SensorHandle> {
        Arc::clone(&self.handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let id = self.handle.id();
        let mut next_check = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep_until(next_check) => {}
            }

            let sample = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                sample = self.source.check() => sample,
            };

            let now = Instant::now();
            if let Some(event) = self.evaluate(sample, now) {
                self.emit(event);
            }
            next_check = deadline(now, self.next_delay(now));
        }

        debug!(sensor = id, "sensor monitor stopped");
    }

    /// Applies one sample and returns the event it confirms, if any.
    fn evaluate(&mut self, sample: Sample, now: Instant) -> Option<Event> {
        let config = self.handle.config();
        match sample {
            Sample::Discard { reason } => {
                warn!(sensor = config.id, %reason, "sample discarded");
                None
            }
            Sample::Failure { message, reason } => {
                self.pending = None;
                if self.handle.state().is_triggered() {
                    debug!(sensor = config.id, %reason, "check failed again");
                    return None;
                }
                warn!(sensor = config.id, %message, %reason, "sensor check failed");
                self.handle.apply_transition(SensorState::Triggered, None);

                let mut optional_data = OptionalData::new();
                optional_data.insert("message".into(), json!(message));
                optional_data.insert("reason".into(), json!(reason));
                Some(
                    SensorAlert::new(config.id, SensorState::Triggered, config.alert_levels.clone(), optional_data)
                        .into(),
                )
            }
            Sample::Reading { raw_state, data, optional_data } => {
                let observed = SensorState::from_raw(raw_state, config.trigger_state);
                if observed == self.handle.state() {
                    if self.pending.take().is_some() {
                        debug!(sensor = config.id, state = %observed, "pending transition reverted");
                    }
                    self.handle.update_data(data);
                    return None;
                }

                if !config.alert_delay.is_zero() {
                    match self.pending {
                        Some(pending) if pending.target == observed => {
                            if now.duration_since(pending.since) < config.alert_delay {
                                return None;
                            }
                        }
                        _ => {
                            debug!(sensor = config.id, target = %observed, delay = ?config.alert_delay, "transition pending");
                            self.pending = Some(PendingTransition { target: observed, since: now });
                            return None;
                        }
                    }
                }

                self.pending = None;
                Some(self.confirm(observed, data, optional_data))
            }
        }
    }

    fn confirm(&self, state: SensorState, data: SensorData, optional_data: OptionalData) -> Event {
        let config = self.handle.config();
        self.handle.apply_transition(state, Some(data.clone()));
        info!(sensor = config.id, state = %state, "sensor state changed");

        let alert = match state {
            SensorState::Triggered => config.trigger_alert,
            SensorState::Normal => config.trigger_alert_normal,
        };
        if alert {
            SensorAlert::new(config.id, state, config.alert_levels.clone(), optional_data).into()
        } else {
            StateChange::new(config.id, state, data).into()
        }
    }

    fn next_delay(&self, now: Instant) -> Duration {
        let config = self.handle.config();
        match self.pending {
            Some(pending) => {
                let remaining = config.alert_delay.saturating_sub(now.duration_since(pending.since));
                remaining.min(config.interval)
            }
            None => config.interval,
        }
    }

    fn emit(&self, event: Event) {
        if self.shutdown.is_triggered() {
            debug!(sensor = self.handle.id(), "shutdown in progress, event dropped");
            return;
        }
        self.queue.push(event);
    }
}

fn deadline(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + MAX_PERIOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::shutdown::Shutdown;
    use crate::source::{build_source, ExecuteSource};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    /// Source that never gets checked; evaluate() is driven directly.
    struct Idle;

    #[async_trait]
    impl SensorSource for Idle {
        fn kind(&self) -> &'static str {
            "idle"
        }

        async fn initialize(&mut self, _config: &SensorConfig) -> Result<SensorData, SensorError> {
            Ok(SensorData::None)
        }

        async fn check(&mut self) -> Sample {
            Sample::Discard { reason: "idle".into() }
        }
    }

    fn config(execute: &str, alert_delay: Duration) -> SensorConfig {
        SensorConfig {
            id: 1,
            description: "router".into(),
            trigger_state: 1,
            trigger_alert: true,
            trigger_alert_normal: true,
            alert_delay,
            alert_levels: BTreeSet::from([1, 2]),
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(2),
            source: SourceConfig::Ping { execute: PathBuf::from(execute), host: "192.0.2.1".into(), count: 1 },
        }
    }

    fn reading(raw_state: u8) -> Sample {
        Sample::Reading { raw_state, data: SensorData::None, optional_data: OptionalData::new() }
    }

    async fn idle_monitor(config: SensorConfig, shutdown: &Shutdown) -> SensorMonitor {
        SensorMonitor::initialize(config, Box::new(Idle), EventQueue::shared(), shutdown.signal())
            .await
            .unwrap()
    }

    async fn wait_for_events(queue: &EventQueue, count: usize, timeout: Duration) -> Vec<Event> {
        let start = std::time::Instant::now();
        let mut events = Vec::new();
        while start.elapsed() < timeout {
            events.extend(queue.drain());
            if events.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        events
    }

    #[tokio::test]
    async fn test_immediate_transition_without_delay() {
        let shutdown = Shutdown::new();
        let mut monitor = idle_monitor(config("ping", Duration::ZERO), &shutdown).await;
        let now = Instant::now();

        let event = monitor.evaluate(reading(1), now).unwrap();
        let alert = event.as_sensor_alert().unwrap();
        assert_eq!(alert.state, SensorState::Triggered);
        assert_eq!(alert.alert_levels, BTreeSet::from([1, 2]));
        assert_eq!(monitor.handle().state(), SensorState::Triggered);

        assert!(monitor.evaluate(reading(1), now).is_none());
        let back = monitor.evaluate(reading(0), now).unwrap();
        assert_eq!(back.state(), SensorState::Normal);
    }

    #[tokio::test]
    async fn test_debounce_reversal_emits_nothing() {
        let shutdown = Shutdown::new();
        let delay = Duration::from_secs(2);
        let mut monitor = idle_monitor(config("ping", delay), &shutdown).await;
        let start = Instant::now();

        assert!(monitor.evaluate(reading(1), start).is_none());
        assert_eq!(monitor.handle().state(), SensorState::Normal);
        assert!(monitor.evaluate(reading(0), start + Duration::from_secs(1)).is_none());
        assert!(monitor.evaluate(reading(0), start + Duration::from_secs(3)).is_none());
        assert_eq!(monitor.handle().state(), SensorState::Normal);
    }

    #[tokio::test]
    async fn test_debounce_confirms_after_delay() {
        let shutdown = Shutdown::new();
        let delay = Duration::from_secs(2);
        let mut monitor = idle_monitor(config("ping", delay), &shutdown).await;
        let start = Instant::now();

        assert!(monitor.evaluate(reading(1), start).is_none());
        assert_eq!(monitor.next_delay(start + Duration::from_millis(1950)), Duration::from_millis(50));
        assert!(monitor.evaluate(reading(1), start + Duration::from_secs(1)).is_none());
        let event = monitor.evaluate(reading(1), start + delay).unwrap();
        assert_eq!(event.state(), SensorState::Triggered);
        assert!(monitor.evaluate(reading(1), start + Duration::from_secs(5)).is_none());
        assert_eq!(monitor.next_delay(start + Duration::from_secs(5)), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_failure_bypasses_debounce() {
        let shutdown = Shutdown::new();
        let mut monitor = idle_monitor(config("ping", Duration::from_secs(30)), &shutdown).await;
        let now = Instant::now();

        let event = monitor.evaluate(Sample::process_timeout(), now).unwrap();
        let alert = event.as_sensor_alert().unwrap();
        assert_eq!(alert.state, SensorState::Triggered);
        assert_eq!(alert.reason(), Some("processtimeout"));
        assert_eq!(alert.optional_data["message"], "Timeout");
        assert!(monitor.evaluate(Sample::process_timeout(), now).is_none());
    }

    #[tokio::test]
    async fn test_failure_ignores_alert_flags() {
        let shutdown = Shutdown::new();
        let mut cfg = config("ping", Duration::ZERO);
        cfg.trigger_alert = false;
        let mut monitor = idle_monitor(cfg, &shutdown).await;

        let event = monitor.evaluate(Sample::process_error(), Instant::now()).unwrap();
        assert!(event.as_sensor_alert().is_some());
    }

    #[tokio::test]
    async fn test_disabled_alert_flag_yields_state_change() {
        let shutdown = Shutdown::new();
        let mut cfg = config("ping", Duration::ZERO);
        cfg.trigger_alert_normal = false;
        let mut monitor = idle_monitor(cfg, &shutdown).await;
        monitor.handle.set_state(SensorState::Triggered);

        let event = monitor.evaluate(reading(0), Instant::now()).unwrap();
        assert_eq!(event.as_state_change().unwrap().state, SensorState::Normal);
    }

    #[tokio::test]
    async fn test_invalid_definition_is_rejected() {
        let shutdown = Shutdown::new();
        let mut cfg = config("ping", Duration::ZERO);
        cfg.trigger_state = 2;
        let result = SensorMonitor::initialize(cfg, Box::new(Idle), EventQueue::shared(), shutdown.signal()).await;
        assert!(matches!(result, Err(SensorError::InvalidConfig(_))));
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(deadline(now, Duration::from_secs(1)), now + Duration::from_secs(1));
        assert_eq!(deadline(now, Duration::MAX), now + MAX_PERIOD);
    }

    #[tokio::test]
    async fn test_discard_keeps_state_and_data() {
        let shutdown = Shutdown::new();
        let mut monitor = idle_monitor(config("ping", Duration::ZERO), &shutdown).await;
        assert!(monitor.evaluate(Sample::Discard { reason: "noise".into() }, Instant::now()).is_none());
        assert_eq!(monitor.handle().state(), SensorState::Normal);
    }

    async fn run_ping(execute: &str, trigger_alert: bool, trigger_alert_normal: bool) -> Vec<Event> {
        run_ping_from(SensorState::Normal, execute, trigger_alert, trigger_alert_normal).await
    }

    async fn run_ping_from(
        state: SensorState,
        execute: &str,
        trigger_alert: bool,
        trigger_alert_normal: bool,
    ) -> Vec<Event> {
        let shutdown = Shutdown::new();
        let mut cfg = config(execute, Duration::ZERO);
        cfg.trigger_alert = trigger_alert;
        cfg.trigger_alert_normal = trigger_alert_normal;
        let source = build_source(&cfg, None).unwrap();
        let queue = EventQueue::shared();
        let monitor = SensorMonitor::initialize(cfg, source, queue.clone(), shutdown.signal())
            .await
            .unwrap();
        monitor.handle.set_state(state);
        let task = monitor.spawn();

        let events = wait_for_events(&queue, 1, Duration::from_millis(800)).await;
        shutdown.trigger();
        task.await.unwrap();
        events
    }

    #[tokio::test]
    async fn test_reachable_host_emits_nothing() {
        for (trigger_alert, trigger_alert_normal) in [(true, true), (false, false), (true, false), (false, true)] {
            let events = run_ping("true", trigger_alert, trigger_alert_normal).await;
            assert!(events.is_empty(), "unexpected events {events:?}");
        }
    }

    #[tokio::test]
    async fn test_host_becoming_reachable_follows_trigger_alert_normal() {
        let events = run_ping_from(SensorState::Triggered, "true", true, true).await;
        assert_eq!(events.len(), 1);
        let alert = events[0].as_sensor_alert().unwrap();
        assert_eq!(alert.state, SensorState::Normal);
        assert_eq!(alert.reason(), Some("reachable"));
        assert_eq!(alert.optional_data["host"], "192.0.2.1");

        let events = run_ping_from(SensorState::Triggered, "true", true, false).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_state_change().unwrap().state, SensorState::Normal);
    }

    #[tokio::test]
    async fn test_unreachable_host_follows_trigger_alert() {
        let events = run_ping("false", true, false).await;
        assert_eq!(events.len(), 1);
        let alert = events[0].as_sensor_alert().unwrap();
        assert_eq!(alert.state, SensorState::Triggered);
        assert_eq!(alert.reason(), Some("notreachable"));
        assert_eq!(alert.optional_data["host"], "192.0.2.1");

        let events = run_ping("false", false, true).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_state_change().unwrap().state, SensorState::Triggered);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_executable_ping_is_process_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ping");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

        for flags in [(true, true), (false, false)] {
            let events = run_ping(script.to_str().unwrap(), flags.0, flags.1).await;
            assert_eq!(events.len(), 1);
            let alert = events[0].as_sensor_alert().unwrap();
            assert_eq!(alert.reason(), Some("processerror"));
            assert_eq!(alert.optional_data["message"], "Unable to execute process");
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported_once() {
        let shutdown = Shutdown::new();
        let mut cfg = config("sh", Duration::ZERO);
        cfg.timeout = Duration::from_millis(200);
        cfg.interval = Duration::from_millis(50);
        let source = Box::new(ExecuteSource::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "sleep 30".into()],
            cfg.timeout,
        ));
        let queue = EventQueue::shared();
        let task = SensorMonitor::initialize(cfg, source, queue.clone(), shutdown.signal())
            .await
            .unwrap()
            .spawn();

        tokio::time::sleep(Duration::from_millis(900)).await;
        shutdown.trigger();
        task.await.unwrap();

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_sensor_alert().unwrap().reason(), Some("processtimeout"));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_running_check() {
        let shutdown = Shutdown::new();
        let cfg = config("sh", Duration::ZERO);
        let source = Box::new(ExecuteSource::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "sleep 30".into()],
            Duration::from_secs(60),
        ));
        let queue = EventQueue::shared();
        let task = SensorMonitor::initialize(cfg, source, queue.clone(), shutdown.signal())
            .await
            .unwrap()
            .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(queue.is_empty());
    }
}
