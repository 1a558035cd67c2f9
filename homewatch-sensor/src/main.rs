//! Homewatch sensor node
//!
//! Runs one monitor task per configured sensor and forwards their events to
//! the server:
//! - provider collectors refresh shared readings for number sensors
//! - every monitor owns a queue; the publish loop drains them all
//! - changed sensor values go out as data updates between state changes
//! - the registration is replayed after every broker (re)connect

mod config;

use anyhow::{Context, Result};
use config::SensorNodeConfig;
use homewatch_core::source::{build_source, ProviderCollector};
use homewatch_core::storage::{NodeDescriptor, NodeType, SensorDescriptor};
use homewatch_core::telemetry::init_logging;
use homewatch_core::transport::topics;
use homewatch_core::{
    Envelope, EventCollector, EventQueue, LinkEvent, MqttLink, NodeRegistration, SensorData, SensorDataUpdate,
    SensorHandle, SensorMonitor, SensorSnapshot, Shutdown,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct SensorNode {
    config: SensorNodeConfig,
    shutdown: Shutdown,
    handles: Vec<Arc<SensorHandle>>,
    collector: EventCollector,
    tasks: Vec<JoinHandle<()>>,
}

impl SensorNode {
    /// Starts collectors, then initializes every sensor. Any sensor that cannot
    /// produce its first reading aborts startup.
    async fn start(config: SensorNodeConfig) -> Result<Self> {
        let shutdown = Shutdown::new();
        let mut tasks = Vec::new();

        let store = config.new_store();
        if let Some(store) = &store {
            for collector_config in &config.collectors {
                let collector = ProviderCollector::new(collector_config.clone(), store.clone());
                collector.refresh().await;
                tasks.push(tokio::spawn(collector.run(shutdown.signal())));
            }
        }

        let mut handles = Vec::new();
        let mut collector = EventCollector::new();
        for sensor in &config.sensors {
            let source = build_source(sensor, store.as_ref())?;
            let queue = EventQueue::shared();
            let monitor = SensorMonitor::initialize(sensor.clone(), source, queue.clone(), shutdown.signal())
                .await
                .with_context(|| format!("Failed to initialize sensor {} ({})", sensor.id, sensor.description))?;
            handles.push(monitor.handle());
            collector.attach(queue);
            tasks.push(monitor.spawn());
        }
        info!(sensors = handles.len(), collectors = config.collectors.len(), "sensors running");

        Ok(Self { config, shutdown, handles, collector, tasks })
    }

    fn registration(&self) -> NodeRegistration {
        let sensors = self
            .handles
            .iter()
            .map(|handle| {
                let snapshot = handle.snapshot();
                let config = handle.config();
                SensorDescriptor {
                    client_sensor_id: snapshot.id,
                    description: snapshot.description,
                    alert_delay: config.alert_delay,
                    alert_levels: config.alert_levels.clone(),
                    state: snapshot.state,
                    data: snapshot.data,
                }
            })
            .collect();

        NodeRegistration {
            node: NodeDescriptor {
                username: self.config.node.username.clone(),
                hostname: gethostname::gethostname().to_string_lossy().to_string(),
                node_type: NodeType::Sensor,
                instance: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                persistent: self.config.node.persistent,
            },
            sensors,
            alerts: Vec::new(),
            manager: None,
        }
    }

    async fn register(&self, link: &MqttLink) -> Result<()> {
        let registration = Envelope::Registration(self.registration());
        link.publish(topics::REGISTRATION, &registration)
            .await
            .context("Failed to publish registration")?;
        info!(username = %self.config.node.username, "node registered");
        Ok(())
    }

    async fn publish_events(&self, link: &MqttLink) {
        for event in self.collector.drain_all() {
            let sensor = event.sensor_id();
            let envelope = Envelope::Event { node: self.config.node.username.clone(), event };
            match link.publish(topics::SENSOR_EVENTS, &envelope).await {
                Ok(()) => debug!(sensor, "event published"),
                Err(e) => error!(sensor, error = %e, "failed to publish event"),
            }
        }
    }

    async fn publish_data(&self, link: &MqttLink, last_sent: &mut HashMap<i64, SensorData>) {
        let updates = changed_data(self.handles.iter().map(|handle| handle.snapshot()), last_sent);
        if updates.is_empty() {
            return;
        }
        let count = updates.len();
        let envelope = Envelope::SensorData { node: self.config.node.username.clone(), updates };
        match link.publish(topics::SENSOR_DATA, &envelope).await {
            Ok(()) => debug!(sensors = count, "sensor data published"),
            Err(e) => error!(error = %e, "failed to publish sensor data"),
        }
    }

    async fn run(self) -> Result<()> {
        // The link outlives the sensors so events confirmed before shutdown still go out.
        let link_shutdown = Shutdown::new();
        let (link, mut inbound) =
            MqttLink::connect(&self.config.mqtt, &self.config.node.username, link_shutdown.signal());
        let mut publish_timer = interval(self.config.publish_interval);
        let period = self.config.registration_interval;
        let mut registration_timer = interval_at(Instant::now() + period, period);
        let mut data_timer = interval_at(Instant::now() + self.config.data_interval, self.config.data_interval);
        let mut last_sent = HashMap::new();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }

                _ = publish_timer.tick() => self.publish_events(&link).await,

                _ = data_timer.tick() => self.publish_data(&link, &mut last_sent).await,

                _ = registration_timer.tick() => {
                    if let Err(e) = self.register(&link).await {
                        warn!("Failed to refresh registration: {e:#}");
                    }
                }

                message = inbound.recv() => match message {
                    Some(LinkEvent::Connected) => {
                        if let Err(e) = self.register(&link).await {
                            error!("Failed to register: {e:#}");
                        }
                    }
                    Some(other) => debug!(?other, "ignoring inbound message"),
                    None => {
                        warn!("MQTT link closed");
                        break;
                    }
                },
            }
        }

        self.stop(&link).await;

        if let Err(e) = link.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async { while inbound.recv().await.is_some() {} });
        if drained.await.is_err() {
            warn!("MQTT link did not close in time");
        }
        link_shutdown.trigger();
        info!("sensor node stopped");
        Ok(())
    }

    async fn stop(mut self, link: &MqttLink) {
        self.shutdown.trigger();
        let tasks = futures::future::join_all(std::mem::take(&mut self.tasks));
        if tokio::time::timeout(SHUTDOWN_GRACE, tasks).await.is_err() {
            warn!("sensor tasks did not stop in time");
        }
        self.publish_events(link).await;
    }
}

/// Data of sensors that hold a value which differs from what was last sent.
fn changed_data(
    snapshots: impl IntoIterator<Item = SensorSnapshot>,
    last_sent: &mut HashMap<i64, SensorData>,
) -> Vec<SensorDataUpdate> {
    let mut updates = Vec::new();
    for snapshot in snapshots {
        if snapshot.data.is_none() || last_sent.get(&snapshot.id) == Some(&snapshot.data) {
            continue;
        }
        last_sent.insert(snapshot.id, snapshot.data.clone());
        updates.push(SensorDataUpdate { sensor_id: snapshot.id, data: snapshot.data });
    }
    updates
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("homewatch_sensor=info,homewatch_core=info");
    info!("Homewatch sensor node starting...");

    let config = SensorNodeConfig::load().await.context("Failed to load configuration")?;
    let node = SensorNode::start(config).await.context("Failed to start sensors")?;
    node.run().await.context("Sensor node execution failed")?;

    Ok(())
}
