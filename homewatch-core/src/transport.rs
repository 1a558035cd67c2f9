//! MQTT wire format and client adapter.
//!
//! Every message except node status is a JSON `Envelope`. Node status topics
//! carry the plain strings `online` / `offline`; `offline` is also each
//! node's last will, so the server learns about dropped connections from the
//! broker.

use crate::config::MqttSettings;
use crate::error::TransportError;
use crate::event::Event;
use crate::model::{Profile, SensorData};
use crate::shutdown::ShutdownSignal;
use crate::storage::{AlertDescriptor, ManagerDescriptor, NodeDescriptor, SensorDescriptor};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub mod topics {
    pub const REGISTRATION: &str = "homewatch/nodes/registration@v1";
    pub const SENSOR_EVENTS: &str = "homewatch/sensors/event@v1";
    pub const SENSOR_DATA: &str = "homewatch/sensors/data@v1";
    pub const ALERT_EVENTS: &str = "homewatch/alerts/event@v1";
    pub const PROFILE: &str = "homewatch/system/profile@v1";
    pub const NODE_STATUS_PREFIX: &str = "homewatch/nodes/status@v1/";
    pub const NODE_STATUS_ALL: &str = "homewatch/nodes/status@v1/+";

    pub fn node_status(username: &str) -> String {
        format!("{NODE_STATUS_PREFIX}{username}")
    }

    pub fn status_username(topic: &str) -> Option<&str> {
        topic.strip_prefix(NODE_STATUS_PREFIX).filter(|name| !name.is_empty())
    }
}

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

/// Everything a node tells the server when it (re)connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node: NodeDescriptor,
    #[serde(default)]
    pub sensors: Vec<SensorDescriptor>,
    #[serde(default)]
    pub alerts: Vec<AlertDescriptor>,
    #[serde(default)]
    pub manager: Option<ManagerDescriptor>,
}

/// Latest value of one sensor whose state did not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDataUpdate {
    pub sensor_id: i64,
    pub data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Registration(NodeRegistration),
    /// Sensor event; `node` is the username of the sensor node that produced it.
    Event { node: String, event: Event },
    /// Periodic data refresh of a sensor node. Never forwarded to alert nodes.
    SensorData { node: String, updates: Vec<SensorDataUpdate> },
    ProfileChange(Profile),
}

impl Envelope {
    pub fn to_payload(&self) -> Result<Vec<u8>, TransportError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// What the link hands to the node.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The broker accepted the connection (also after a reconnect).
    Connected,
    Envelope { topic: String, envelope: Envelope },
    Status { username: String, online: bool },
}

#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    username: String,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl MqttLink {
    /// Creates the client and spawns its event loop. The loop keeps reconnecting
    /// until `shutdown` fires, [`MqttLink::disconnect`] went out, or the returned
    /// receiver is dropped. The receiver yields `None` once the loop has ended.
    pub fn connect(
        settings: &MqttSettings,
        username: &str,
        shutdown: ShutdownSignal,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let mut options = MqttOptions::new(format!("homewatch-{username}"), &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics::node_status(username),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let subscriptions = Arc::new(Mutex::new(Vec::<String>::new()));
        let (tx, rx) = mpsc::channel(64);

        let link = Self { client: client.clone(), username: username.to_string(), subscriptions: subscriptions.clone() };
        let status_topic = topics::node_status(username);

        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    polled = eventloop.poll() => polled,
                };

                let event = match polled {
                    Ok(rumqttc::Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        for topic in subscriptions.lock().iter() {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                warn!(%topic, error = %e, "resubscribe failed");
                            }
                        }
                        if let Err(e) = client.try_publish(status_topic.as_str(), QoS::AtLeastOnce, true, STATUS_ONLINE) {
                            warn!(error = %e, "status publish failed");
                        }
                        Some(LinkEvent::Connected)
                    }
                    Ok(rumqttc::Event::Incoming(Incoming::Publish(publish))) => decode(&publish.topic, &publish.payload),
                    Ok(rumqttc::Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => None,
                    Err(e) => {
                        error!(error = %e, "MQTT connection error");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        None
                    }
                };

                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            debug!("MQTT event loop stopped");
        });

        (link, rx)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Subscribes now and again after every reconnect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.lock().push(topic.to_string());
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        self.client.publish(topic, QoS::AtLeastOnce, false, envelope.to_payload()?).await?;
        Ok(())
    }

    /// Announces a clean shutdown and closes the connection.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .publish(topics::node_status(&self.username), QoS::AtLeastOnce, true, STATUS_OFFLINE)
            .await?;
        self.client.disconnect().await?;
        Ok(())
    }
}

fn decode(topic: &str, payload: &[u8]) -> Option<LinkEvent> {
    if let Some(username) = topics::status_username(topic) {
        let online = payload == STATUS_ONLINE.as_bytes();
        return Some(LinkEvent::Status { username: username.to_string(), online });
    }
    match Envelope::from_payload(payload) {
        Ok(envelope) => Some(LinkEvent::Envelope { topic: topic.to_string(), envelope }),
        Err(e) => {
            warn!(%topic, error = %e, "undecodable message dropped");
            None
        }
    }
}
