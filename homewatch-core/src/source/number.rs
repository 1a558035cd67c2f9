use super::readings::ReadingStore;
use super::{Sample, SensorSource};
use crate::config::{SensorConfig, ThresholdOrdering, ValueType};
use crate::error::SensorError;
use crate::executor::{ProcessExecutor, ProcessOutcome};
use crate::model::{SensorData, SensorState};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of reading one numeric value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Value(f64),
    /// The reader could not run at all.
    Failure { message: String, reason: String },
    /// The reader ran but produced nothing usable.
    Invalid(String),
}

/// Where a number sensor gets its values from.
#[async_trait]
pub trait ValueReader: Send {
    async fn read(&mut self) -> ReadOutcome;
}

/// Runs a command and parses its trimmed stdout as a number.
pub struct CommandValueReader {
    execute: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandValueReader {
    pub fn new(execute: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self { execute, args, timeout }
    }
}

#[async_trait]
impl ValueReader for CommandValueReader {
    async fn read(&mut self) -> ReadOutcome {
        match ProcessExecutor::run(&self.execute, &self.args, self.timeout).await {
            ProcessOutcome::Exited(info) if info.success() => match info.stdout.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => ReadOutcome::Value(value),
                _ => ReadOutcome::Invalid(format!("unparsable output '{}'", info.stdout.trim())),
            },
            ProcessOutcome::Exited(info) => ReadOutcome::Invalid(format!("reader exited with {:?}", info.code)),
            ProcessOutcome::SpawnFailed(_) => ReadOutcome::Failure {
                message: "Unable to execute process".into(),
                reason: "processerror".into(),
            },
            ProcessOutcome::TimedOut { .. } => ReadOutcome::Failure {
                message: "Timeout".into(),
                reason: "processtimeout".into(),
            },
        }
    }
}

/// Reads the last value a provider collector stored under `key`.
pub struct StoreValueReader {
    store: ReadingStore,
    key: String,
}

impl StoreValueReader {
    pub fn new(store: ReadingStore, key: String) -> Self {
        Self { store, key }
    }
}

#[async_trait]
impl ValueReader for StoreValueReader {
    async fn read(&mut self) -> ReadOutcome {
        match self.store.get(&self.key) {
            Some(value) => ReadOutcome::Value(value),
            None => ReadOutcome::Invalid(format!("no current value for '{}'", self.key)),
        }
    }
}

/// Numeric sensor: triggered while the value is on the `ordering` side of `threshold`.
pub struct NumberSource {
    reader: Box<dyn ValueReader>,
    threshold: f64,
    ordering: ThresholdOrdering,
    unit: String,
    value_type: ValueType,
    sane_lowest_value: Option<f64>,
    trigger_state: u8,
}

impl NumberSource {
    pub fn new(
        reader: Box<dyn ValueReader>,
        threshold: f64,
        ordering: ThresholdOrdering,
        unit: String,
        value_type: ValueType,
        sane_lowest_value: Option<f64>,
    ) -> Self {
        Self {
            reader,
            threshold,
            ordering,
            unit,
            value_type,
            sane_lowest_value,
            trigger_state: 1,
        }
    }

    fn to_data(&self, value: f64) -> SensorData {
        match self.value_type {
            ValueType::Int => SensorData::Int { value: value.round() as i64, unit: self.unit.clone() },
            ValueType::Float => SensorData::Float { value, unit: self.unit.clone() },
        }
    }

    fn is_sane(&self, value: f64) -> bool {
        self.sane_lowest_value.map_or(true, |floor| value >= floor)
    }
}

#[async_trait]
impl SensorSource for NumberSource {
    fn kind(&self) -> &'static str {
        "number"
    }

    async fn initialize(&mut self, config: &SensorConfig) -> Result<SensorData, SensorError> {
        self.trigger_state = config.trigger_state;
        match self.reader.read().await {
            ReadOutcome::Value(value) if self.is_sane(value) => Ok(self.to_data(value)),
            ReadOutcome::Value(value) => Err(SensorError::NoInitialData {
                id: config.id,
                reason: format!("value {value} below sane lowest value"),
            }),
            ReadOutcome::Failure { message, .. } => Err(SensorError::NoInitialData { id: config.id, reason: message }),
            ReadOutcome::Invalid(reason) => Err(SensorError::NoInitialData { id: config.id, reason }),
        }
    }

    async fn check(&mut self) -> Sample {
        let value = match self.reader.read().await {
            ReadOutcome::Value(value) => value,
            ReadOutcome::Failure { message, reason } => return Sample::Failure { message, reason },
            ReadOutcome::Invalid(reason) => {
                debug!(%reason, "number reading skipped");
                return Sample::Discard { reason };
            }
        };

        if !self.is_sane(value) {
            warn!(value, floor = ?self.sane_lowest_value, "implausible reading discarded");
            return Sample::Discard { reason: format!("value {value} below sane lowest value") };
        }

        let state = if self.ordering.crossed(value, self.threshold) {
            SensorState::Triggered
        } else {
            SensorState::Normal
        };
        let mut optional_data = super::reason("threshold");
        optional_data.insert("value".into(), json!(value));
        optional_data.insert("threshold".into(), json!(self.threshold));
        Sample::Reading {
            raw_state: state.to_raw(self.trigger_state),
            data: self.to_data(value),
            optional_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use std::collections::{BTreeSet, VecDeque};

    struct Scripted(VecDeque<ReadOutcome>);

    #[async_trait]
    impl ValueReader for Scripted {
        async fn read(&mut self) -> ReadOutcome {
            self.0.pop_front().unwrap_or(ReadOutcome::Invalid("exhausted".into()))
        }
    }

    fn config() -> SensorConfig {
        SensorConfig {
            id: 7,
            description: "boiler temperature".into(),
            trigger_state: 1,
            trigger_alert: true,
            trigger_alert_normal: true,
            alert_delay: Duration::ZERO,
            alert_levels: BTreeSet::from([1]),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            source: SourceConfig::Execute { execute: "true".into(), args: vec![] },
        }
    }

    fn source(outcomes: Vec<ReadOutcome>) -> NumberSource {
        NumberSource::new(
            Box::new(Scripted(outcomes.into())),
            80.0,
            ThresholdOrdering::Gt,
            "°C".into(),
            ValueType::Float,
            Some(-40.0),
        )
    }

    #[tokio::test]
    async fn test_threshold_crossing() {
        let mut number = source(vec![
            ReadOutcome::Value(60.0),
            ReadOutcome::Value(85.0),
            ReadOutcome::Value(70.0),
        ]);
        let initial = number.initialize(&config()).await.unwrap();
        assert_eq!(initial.as_f64(), Some(60.0));

        match number.check().await {
            Sample::Reading { raw_state, data, optional_data } => {
                assert_eq!(raw_state, 1);
                assert_eq!(data.as_f64(), Some(85.0));
                assert_eq!(optional_data["threshold"], 80.0);
            }
            other => panic!("unexpected sample {other:?}"),
        }
        match number.check().await {
            Sample::Reading { raw_state, .. } => assert_eq!(raw_state, 0),
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_insane_values_are_discarded() {
        let mut number = source(vec![ReadOutcome::Value(20.0), ReadOutcome::Value(-273.0)]);
        number.initialize(&config()).await.unwrap();
        assert!(matches!(number.check().await, Sample::Discard { .. }));
    }

    #[tokio::test]
    async fn test_initialize_requires_a_value() {
        let mut number = source(vec![ReadOutcome::Invalid("empty".into())]);
        let err = number.initialize(&config()).await.unwrap_err();
        assert!(matches!(err, SensorError::NoInitialData { id: 7, .. }));
    }

    #[tokio::test]
    async fn test_int_values_with_inverted_polarity() {
        let mut number = NumberSource::new(
            Box::new(Scripted(vec![ReadOutcome::Value(3.0), ReadOutcome::Value(1.4)].into())),
            2.0,
            ThresholdOrdering::Lt,
            "bar".into(),
            ValueType::Int,
            None,
        );
        let mut cfg = config();
        cfg.trigger_state = 0;
        assert_eq!(
            number.initialize(&cfg).await.unwrap(),
            SensorData::Int { value: 3, unit: "bar".into() }
        );
        match number.check().await {
            Sample::Reading { raw_state, data, .. } => {
                assert_eq!(raw_state, 0);
                assert_eq!(data, SensorData::Int { value: 1, unit: "bar".into() });
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_command_reader_parses_stdout() {
        let mut reader = CommandValueReader::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "echo '  42.5 '".into()],
            Duration::from_secs(2),
        );
        assert_eq!(reader.read().await, ReadOutcome::Value(42.5));

        let mut garbage = CommandValueReader::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "echo hot".into()],
            Duration::from_secs(2),
        );
        assert!(matches!(garbage.read().await, ReadOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn test_store_reader() {
        let store = ReadingStore::new();
        let mut reader = StoreValueReader::new(store.clone(), "Humidity".into());
        assert!(matches!(reader.read().await, ReadOutcome::Invalid(_)));
        store.record_success("humidity", 55.0);
        assert_eq!(reader.read().await, ReadOutcome::Value(55.0));
    }
}
