use thiserror::Error;

/// Invalid sensor/alert/node definitions. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate sensor id {0}")]
    DuplicateSensor(i64),
    #[error("duplicate alert id {0}")]
    DuplicateAlert(i64),
    #[error("sensor {id}: {reason}")]
    InvalidSensor { id: i64, reason: String },
    #[error("alert {id}: {reason}")]
    InvalidAlert { id: i64, reason: String },
    #[error("invalid node settings: {0}")]
    InvalidNode(String),
}

impl ConfigError {
    pub fn sensor(id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidSensor { id, reason: reason.into() }
    }

    pub fn alert(id: i64, reason: impl Into<String>) -> Self {
        Self::InvalidAlert { id, reason: reason.into() }
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {id} could not obtain an initial reading: {reason}")]
    NoInitialData { id: i64, reason: String },
    #[error("sensor {id} source is not usable: {reason}")]
    Unusable { id: i64, reason: String },
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Failure of a single alert handler callback.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert command failed: {0}")]
    Command(String),
    #[error("alert command timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("alert handler panicked")]
    Panicked,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("node not found: {0}")]
    UnknownNode(i64),
    #[error("node not registered: {0}")]
    UnknownUsername(String),
    #[error("sensor {client_id} of node {node_id} not found")]
    UnknownSensor { node_id: i64, client_id: i64 },
    #[error("node type mismatch for '{username}': stored {stored}, got {got}")]
    NodeTypeMismatch { username: String, stored: String, got: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
