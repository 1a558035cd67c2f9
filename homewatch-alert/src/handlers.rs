//! Bundled alert handlers
//!
//! - `log`: writes every callback to the log, nothing else
//! - `command`: runs a configured argv template per callback

use async_trait::async_trait;
use homewatch_core::config::duration_secs;
use homewatch_core::{
    AlertError, AlertHandler, ConfigError, ProcessExecutor, ProcessOutcome, Profile, SensorAlert,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfig {
    Log,
    Command {
        #[serde(default)]
        triggered: Option<String>,
        #[serde(default)]
        normal: Option<String>,
        #[serde(default)]
        profile_change: Option<String>,
        #[serde(default = "default_command_timeout", with = "duration_secs")]
        timeout: Duration,
    },
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

pub fn build_handler(alert_id: i64, description: &str, config: &HandlerConfig) -> Result<Box<dyn AlertHandler>, ConfigError> {
    let handler: Box<dyn AlertHandler> = match config {
        HandlerConfig::Log => Box::new(LogHandler { alert_id, description: description.to_string() }),
        HandlerConfig::Command { triggered, normal, profile_change, timeout } => Box::new(CommandHandler::new(
            alert_id,
            triggered.as_deref(),
            normal.as_deref(),
            profile_change.as_deref(),
            *timeout,
        )?),
    };
    Ok(handler)
}

pub struct LogHandler {
    alert_id: i64,
    description: String,
}

#[async_trait]
impl AlertHandler for LogHandler {
    async fn initialize(&self) -> bool {
        true
    }

    async fn alert_triggered(&self, alert: &SensorAlert) -> Result<(), AlertError> {
        info!(alert = self.alert_id, description = %self.description, sensor = alert.sensor_id, reason = ?alert.reason(), "ALERT triggered");
        Ok(())
    }

    async fn alert_normal(&self, alert: &SensorAlert) -> Result<(), AlertError> {
        info!(alert = self.alert_id, description = %self.description, sensor = alert.sensor_id, "alert back to normal");
        Ok(())
    }

    async fn alert_profile_change(&self, profile: &Profile) -> Result<(), AlertError> {
        info!(alert = self.alert_id, profile = profile.id, name = %profile.name, "profile changed");
        Ok(())
    }
}

/// Values substituted into command templates.
#[derive(Debug, Default)]
struct Placeholders {
    alert_id: i64,
    sensor_id: Option<i64>,
    state: Option<u8>,
    profile: Option<(i64, String)>,
}

impl Placeholders {
    fn apply(&self, arg: &str) -> String {
        let mut out = arg.replace("{alert_id}", &self.alert_id.to_string());
        if let Some(sensor_id) = self.sensor_id {
            out = out.replace("{sensor_id}", &sensor_id.to_string());
        }
        if let Some(state) = self.state {
            out = out.replace("{state}", &state.to_string());
        }
        if let Some((id, name)) = &self.profile {
            out = out.replace("{profile_id}", &id.to_string()).replace("{profile_name}", name);
        }
        out
    }
}

/// Runs one command per callback. Templates are split into argv before
/// substitution, so event content is never interpreted by a shell.
pub struct CommandHandler {
    alert_id: i64,
    triggered: Option<Vec<String>>,
    normal: Option<Vec<String>>,
    profile_change: Option<Vec<String>>,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(
        alert_id: i64,
        triggered: Option<&str>,
        normal: Option<&str>,
        profile_change: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let split = |template: Option<&str>| -> Result<Option<Vec<String>>, ConfigError> {
            let Some(template) = template else {
                return Ok(None);
            };
            let argv = shell_words::split(template)
                .map_err(|e| ConfigError::alert(alert_id, format!("invalid command '{template}': {e}")))?;
            if argv.is_empty() {
                return Err(ConfigError::alert(alert_id, "command is empty"));
            }
            Ok(Some(argv))
        };

        Ok(Self {
            alert_id,
            triggered: split(triggered)?,
            normal: split(normal)?,
            profile_change: split(profile_change)?,
            timeout,
        })
    }

    fn templates(&self) -> impl Iterator<Item = &Vec<String>> {
        [&self.triggered, &self.normal, &self.profile_change].into_iter().flatten()
    }

    async fn run(&self, template: Option<&Vec<String>>, placeholders: Placeholders) -> Result<(), AlertError> {
        let Some(template) = template else {
            return Ok(());
        };
        let argv: Vec<String> = template.iter().map(|arg| placeholders.apply(arg)).collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AlertError::Command("command is empty".into()))?;
        debug!(alert = self.alert_id, %program, "running alert command");

        match ProcessExecutor::run(program, args, self.timeout).await {
            ProcessOutcome::Exited(info) if info.success() => Ok(()),
            ProcessOutcome::Exited(info) => Err(AlertError::Command(format!(
                "{program} exited with {:?}: {}",
                info.code,
                info.stderr.trim()
            ))),
            ProcessOutcome::SpawnFailed(e) => Err(AlertError::Command(format!("{program} could not be started: {e}"))),
            ProcessOutcome::TimedOut { .. } => Err(AlertError::Timeout(self.timeout)),
        }
    }

    fn for_alert(&self, alert: &SensorAlert) -> Placeholders {
        Placeholders {
            alert_id: self.alert_id,
            sensor_id: Some(alert.sensor_id),
            state: Some(alert.state.into()),
            profile: None,
        }
    }
}

#[async_trait]
impl AlertHandler for CommandHandler {
    /// Refuses to start when a configured program path does not exist.
    async fn initialize(&self) -> bool {
        for argv in self.templates() {
            let program = Path::new(&argv[0]);
            if program.is_absolute() && !program.exists() {
                warn!(alert = self.alert_id, program = %program.display(), "alert command not found");
                return false;
            }
        }
        true
    }

    async fn alert_triggered(&self, alert: &SensorAlert) -> Result<(), AlertError> {
        self.run(self.triggered.as_ref(), self.for_alert(alert)).await
    }

    async fn alert_normal(&self, alert: &SensorAlert) -> Result<(), AlertError> {
        self.run(self.normal.as_ref(), self.for_alert(alert)).await
    }

    async fn alert_profile_change(&self, profile: &Profile) -> Result<(), AlertError> {
        let placeholders = Placeholders {
            alert_id: self.alert_id,
            profile: Some((profile.id, profile.name.clone())),
            ..Default::default()
        };
        self.run(self.profile_change.as_ref(), placeholders).await
    }
}
