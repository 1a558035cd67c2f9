//! Homewatch alert node
//!
//! Subscribes to the alert event and profile topics, routes every sensor alert
//! through the alert-level router and runs the configured handlers:
//! - each alert reacts at most once per state change
//! - handler failures are logged, the other alerts still run
//! - the registration is replayed after every broker (re)connect

mod config;
mod handlers;

use anyhow::{Context, Result};
use config::AlertNodeConfig;
use homewatch_core::storage::{AlertDescriptor, NodeDescriptor, NodeType};
use homewatch_core::telemetry::init_logging;
use homewatch_core::transport::topics;
use homewatch_core::{AlertLevelRouter, DispatchReport, Envelope, LinkEvent, MqttLink, NodeRegistration, Shutdown};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

struct AlertNode {
    config: AlertNodeConfig,
    router: AlertLevelRouter,
}

impl AlertNode {
    async fn new(config: AlertNodeConfig) -> Result<Self> {
        let mut router = AlertLevelRouter::new();
        for entry in &config.alerts {
            let handler = handlers::build_handler(entry.alert.id, &entry.alert.description, &entry.handler)?;
            router.register(entry.alert.clone(), Arc::from(handler))?;
        }
        router.initialize_all().await;
        Ok(Self { config, router })
    }

    fn registration(&self) -> NodeRegistration {
        NodeRegistration {
            node: NodeDescriptor {
                username: self.config.node.username.clone(),
                hostname: gethostname::gethostname().to_string_lossy().to_string(),
                node_type: NodeType::Alert,
                instance: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                persistent: self.config.node.persistent,
            },
            sensors: Vec::new(),
            alerts: self
                .config
                .alerts
                .iter()
                .map(|entry| AlertDescriptor {
                    client_alert_id: entry.alert.id,
                    description: entry.alert.description.clone(),
                    alert_levels: entry.alert.alert_levels.clone(),
                })
                .collect(),
            manager: None,
        }
    }

    async fn handle(&self, link: &MqttLink, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                let registration = Envelope::Registration(self.registration());
                match link.publish(topics::REGISTRATION, &registration).await {
                    Ok(()) => info!(username = %self.config.node.username, "node registered"),
                    Err(e) => error!(error = %e, "Failed to register"),
                }
            }
            LinkEvent::Envelope { envelope: Envelope::Event { node, event }, .. } => {
                let report = self.router.dispatch_from(&node, &event).await;
                log_report("sensor event", &report);
            }
            LinkEvent::Envelope { envelope: Envelope::ProfileChange(profile), .. } => {
                let report = self.router.profile_change(&profile).await;
                log_report("profile change", &report);
            }
            LinkEvent::Envelope { topic, .. } => debug!(%topic, "ignoring envelope"),
            LinkEvent::Status { .. } => {}
        }
    }

    async fn run(self) -> Result<()> {
        let shutdown = Shutdown::new();
        let (link, mut inbound) = MqttLink::connect(&self.config.mqtt, &self.config.node.username, shutdown.signal());
        link.subscribe(topics::ALERT_EVENTS).await.context("Failed to subscribe to alert events")?;
        link.subscribe(topics::PROFILE).await.context("Failed to subscribe to profile changes")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
                message = inbound.recv() => match message {
                    Some(event) => self.handle(&link, event).await,
                    None => {
                        warn!("MQTT link closed");
                        break;
                    }
                },
            }
        }

        if let Err(e) = link.disconnect().await {
            debug!(error = %e, "disconnect failed");
        }
        shutdown.trigger();
        for status in self.router.alert_states().await {
            debug!(alert = status.id, state = %status.state, enabled = status.enabled, "final alert state");
        }
        for record in self.router.system_state().snapshot() {
            debug!(node = %record.origin, sensor = record.sensor_id, state = %record.state, "last known sensor state");
        }
        info!("alert node stopped");
        Ok(())
    }
}

fn log_report(what: &str, report: &DispatchReport) {
    if report.invoked.is_empty() {
        return;
    }
    if report.is_clean() {
        debug!(what, alerts = ?report.invoked, "dispatched");
    } else {
        for failure in &report.failures {
            warn!(what, alert = failure.alert_id, callback = failure.callback, error = %failure.error, "alert failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("homewatch_alert=info,homewatch_core=info");
    info!("Homewatch alert node starting...");

    let config = AlertNodeConfig::load().await.context("Failed to load configuration")?;
    let node = AlertNode::new(config).await.context("Failed to set up alerts")?;
    node.run().await.context("Alert node execution failed")?;

    Ok(())
}
