/*!
# homewatch-core

Shared building blocks of the homewatch monitoring network:
- sensor sources, the per-sensor monitor and its event queue
- alert-level routing and the alert handler contract
- the storage contract kept by the server
- the MQTT envelope and client adapter every node speaks
*/

pub mod alert;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod source;
pub mod storage;
pub mod telemetry;
pub mod transport;

pub use alert::AlertHandler;
pub use config::{AlertConfig, CollectorConfig, MqttSettings, NodeSettings, SensorConfig, SourceConfig};
pub use error::{AlertError, ConfigError, SensorError, StorageError, TransportError};
pub use event::{Event, SensorAlert, StateChange};
pub use executor::{ExitInfo, ProcessExecutor, ProcessOutcome};
pub use model::{OptionalData, Profile, SensorData, SensorHandle, SensorSnapshot, SensorState};
pub use monitor::SensorMonitor;
pub use queue::{EventCollector, EventQueue};
pub use router::{AlertLevelRouter, AlertStatus, DispatchReport, SystemState};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use storage::{MemoryStorage, Storage};
pub use transport::{Envelope, LinkEvent, MqttLink, NodeRegistration, SensorDataUpdate};
