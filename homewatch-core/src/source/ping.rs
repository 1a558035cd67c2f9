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

/// Checks host reachability with `<execute> -c<count> <host>`.
pub struct PingSource {
    execute: PathBuf,
    host: String,
    count: u32,
    timeout: Duration,
    trigger_state: u8,
}

impl PingSource {
    pub fn new(execute: PathBuf, host: String, count: u32, timeout: Duration) -> Self {
        Self { execute, host, count, timeout, trigger_state: 1 }
    }

    fn args(&self) -> Vec<String> {
        vec![format!("-c{}", self.count), self.host.clone()]
    }
}

#[async_trait]
impl SensorSource for PingSource {
    fn kind(&self) -> &'static str {
        "ping"
    }

    async fn initialize(&mut self, config: &SensorConfig) -> Result<SensorData, SensorError> {
        self.trigger_state = config.trigger_state;
        Ok(SensorData::None)
    }

    async fn check(&mut self) -> Sample {
        let info = match ProcessExecutor::run(&self.execute, &self.args(), self.timeout).await {
            ProcessOutcome::Exited(info) => info,
            ProcessOutcome::SpawnFailed(e) => {
                debug!(host = %self.host, error = %e, "ping could not be started");
                return Sample::process_error();
            }
            ProcessOutcome::TimedOut { .. } => return Sample::process_timeout(),
        };

        let (state, why) = if info.success() {
            (SensorState::Normal, "reachable")
        } else {
            (SensorState::Triggered, "notreachable")
        };
        debug!(host = %self.host, code = ?info.code, why, "ping finished");

        let mut optional_data = reason(why);
        optional_data.insert("host".into(), json!(self.host));
        Sample::Reading {
            raw_state: state.to_raw(self.trigger_state),
            data: SensorData::None,
            optional_data,
        }
    }
}
