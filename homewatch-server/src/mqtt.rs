use crate::health::HealthTracker;
use crate::registry::SharedNodeRegistry;
use homewatch_core::transport::topics;
use homewatch_core::{Envelope, LinkEvent, MqttLink};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub const SERVER_USERNAME: &str = "server";

/// Subscribes the server topics and feeds inbound traffic into the registry.
/// Sensor events are forwarded to the alert topic whether or not they could be stored.
pub fn spawn_mqtt_listener(
    link: MqttLink,
    mut inbound: mpsc::Receiver<LinkEvent>,
    registry: SharedNodeRegistry,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        for topic in [topics::REGISTRATION, topics::SENSOR_EVENTS, topics::SENSOR_DATA, topics::NODE_STATUS_ALL] {
            if let Err(e) = link.subscribe(topic).await {
                error!(%topic, error = %e, "subscribe MQTT failed");
                return;
            }
        }

        while let Some(event) = inbound.recv().await {
            match event {
                LinkEvent::Connected => health.mark_mqtt_connected(),
                LinkEvent::Envelope { envelope: Envelope::Registration(registration), .. } => {
                    let username = registration.node.username.clone();
                    if let Err(e) = registry.handle_registration(registration).await {
                        warn!(%username, error = %e, "registration rejected");
                    }
                }
                LinkEvent::Envelope { envelope: envelope @ Envelope::Event { .. }, .. } => {
                    if let Envelope::Event { node, event } = &envelope {
                        if let Err(e) = registry.handle_event(node, event) {
                            warn!(%node, sensor = event.sensor_id(), error = %e, "failed to store sensor event");
                        }
                    }
                    if let Err(e) = link.publish(topics::ALERT_EVENTS, &envelope).await {
                        error!(error = %e, "failed to forward sensor event");
                    }
                }
                LinkEvent::Envelope { envelope: Envelope::SensorData { node, updates }, .. } => {
                    if let Err(e) = registry.handle_data_update(&node, &updates) {
                        warn!(%node, error = %e, "failed to store sensor data");
                    }
                }
                LinkEvent::Envelope { topic, .. } => debug!(%topic, "ignoring envelope"),
                LinkEvent::Status { username, online: false } => registry.mark_offline(&username).await,
                LinkEvent::Status { username, online: true } => debug!(%username, "node online"),
            }
        }

        health.mark_mqtt_disconnected();
        info!("MQTT listener stopped");
    })
}
