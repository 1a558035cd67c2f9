//! Sensor data sources
//!
//! A source is the part of a sensor that actually looks at the world:
//! - `ping`: host reachability via an external ping command
//! - `execute`: generic command whose exit code is the state
//! - `number`: numeric reading compared against a threshold
//! - `readings`: shared provider data read by number sensors
//!
//! Sources only produce `Sample`s. Polarity, debouncing and event emission
//! belong to the monitor.

mod execute;
mod number;
mod ping;
pub mod readings;

pub use execute::ExecuteSource;
pub use number::{CommandValueReader, NumberSource, ReadOutcome, StoreValueReader, ValueReader};
pub use ping::PingSource;
pub use readings::{ProviderCollector, ReadingStore};

use crate::config::{ReaderConfig, SensorConfig, SourceConfig};
use crate::error::{ConfigError, SensorError};
use crate::model::{OptionalData, SensorData};
use async_trait::async_trait;
use serde_json::json;

/// One observation of a data source.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// Ordinary observation, `raw_state` in the source's own polarity.
    Reading {
        raw_state: u8,
        data: SensorData,
        optional_data: OptionalData,
    },
    /// The source could not be checked at all (spawn error, timeout).
    Failure { message: String, reason: String },
    /// Implausible or unparsable observation; dropped by the monitor.
    Discard { reason: String },
}

impl Sample {
    pub fn process_error() -> Self {
        Sample::Failure {
            message: "Unable to execute process".to_string(),
            reason: "processerror".to_string(),
        }
    }

    pub fn process_timeout() -> Self {
        Sample::Failure {
            message: "Timeout".to_string(),
            reason: "processtimeout".to_string(),
        }
    }
}

/// Capability interface every sensor data source implements.
#[async_trait]
pub trait SensorSource: Send {
    /// Short source name for logs.
    fn kind(&self) -> &'static str;

    /// Prepares the source and returns the first data value.
    ///
    /// May block to obtain a first reading; an error makes the sensor unusable.
    async fn initialize(&mut self, config: &SensorConfig) -> Result<SensorData, SensorError>;

    /// Samples the source once. Must respect the sensor's timeout.
    async fn check(&mut self) -> Sample;
}

/// Builds the configured source. `store` is required by `number` sensors reading from a provider.
pub fn build_source(
    config: &SensorConfig,
    store: Option<&ReadingStore>,
) -> Result<Box<dyn SensorSource>, ConfigError> {
    let source: Box<dyn SensorSource> = match &config.source {
        SourceConfig::Ping { execute, host, count } => {
            Box::new(PingSource::new(execute.clone(), host.clone(), *count, config.timeout))
        }
        SourceConfig::Execute { execute, args } => {
            Box::new(ExecuteSource::new(execute.clone(), args.clone(), config.timeout))
        }
        SourceConfig::Number { reader, threshold, ordering, unit, value_type, sane_lowest_value } => {
            let reader: Box<dyn ValueReader> = match reader {
                ReaderConfig::Command { execute, args } => {
                    Box::new(CommandValueReader::new(execute.clone(), args.clone(), config.timeout))
                }
                ReaderConfig::Store { key } => {
                    let store = store.ok_or_else(|| {
                        ConfigError::sensor(config.id, format!("no provider collector feeds key '{key}'"))
                    })?;
                    Box::new(StoreValueReader::new(store.clone(), key.clone()))
                }
            };
            Box::new(NumberSource::new(
                reader,
                *threshold,
                *ordering,
                unit.clone(),
                *value_type,
                *sane_lowest_value,
            ))
        }
    };
    Ok(source)
}

pub(crate) fn reason(message: &str) -> OptionalData {
    let mut data = OptionalData::new();
    data.insert("reason".into(), json!(message));
    data
}
