use super::{reason, Sample, SensorSource};
use crate::config::SensorConfig;
use crate::error::SensorError;
use crate::executor::{ProcessExecutor, ProcessOutcome};
use crate::model::{SensorData, SensorState};
use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Runs an arbitrary check command. Exit code 0 is normal, anything else is triggered.
pub struct ExecuteSource {
    execute: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    trigger_state: u8,
}

impl ExecuteSource {
    pub fn new(execute: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self { execute, args, timeout, trigger_state: 1 }
    }
}

#[async_trait]
impl SensorSource for ExecuteSource {
    fn kind(&self) -> &'static str {
        "execute"
    }

    async fn initialize(&mut self, config: &SensorConfig) -> Result<SensorData, SensorError> {
        self.trigger_state = config.trigger_state;
        Ok(SensorData::None)
    }

    async fn check(&mut self) -> Sample {
        let info = match ProcessExecutor::run(&self.execute, &self.args, self.timeout).await {
            ProcessOutcome::Exited(info) => info,
            ProcessOutcome::SpawnFailed(e) => {
                debug!(command = %self.execute.display(), error = %e, "check command could not be started");
                return Sample::process_error();
            }
            ProcessOutcome::TimedOut { .. } => return Sample::process_timeout(),
        };

        let state = if info.success() { SensorState::Normal } else { SensorState::Triggered };
        let mut optional_data = reason("exitcode");
        optional_data.insert("exit_code".into(), json!(info.code));
        Sample::Reading {
            raw_state: state.to_raw(self.trigger_state),
            data: SensorData::None,
            optional_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ExecuteSource {
        ExecuteSource::new(
            PathBuf::from("sh"),
            vec!["-c".into(), script.into()],
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_exit_code_maps_to_raw_state() {
        let mut ok = sh("exit 0");
        match ok.check().await {
            Sample::Reading { raw_state, optional_data, .. } => {
                assert_eq!(raw_state, 0);
                assert_eq!(optional_data["exit_code"], 0);
            }
            other => panic!("unexpected sample {other:?}"),
        }

        let mut failing = sh("exit 4");
        match failing.check().await {
            Sample::Reading { raw_state, optional_data, .. } => {
                assert_eq!(raw_state, 1);
                assert_eq!(optional_data["exit_code"], 4);
            }
            other => panic!("unexpected sample {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let mut slow = ExecuteSource::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "sleep 10".into()],
            Duration::from_millis(200),
        );
        assert_eq!(slow.check().await, Sample::process_timeout());
    }

    #[tokio::test]
    async fn test_exit_with_background_child_is_a_reading() {
        let mut check = ExecuteSource::new(
            PathBuf::from("sh"),
            vec!["-c".into(), "sleep 30 & exit 0".into()],
            Duration::from_millis(500),
        );
        match check.check().await {
            Sample::Reading { raw_state, .. } => assert_eq!(raw_state, 0),
            other => panic!("unexpected sample {other:?}"),
        }
    }
}
