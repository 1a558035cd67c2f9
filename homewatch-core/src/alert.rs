use crate::error::AlertError;
use crate::event::SensorAlert;
use crate::model::Profile;
use async_trait::async_trait;

/// Reaction to alert-level traffic (notification, siren, command, ...).
///
/// The router calls at most one of `alert_triggered` / `alert_normal` per
/// state transition of the alert, so implementations need no deduplication.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Returns false when the handler cannot work; it is then disabled.
    async fn initialize(&self) -> bool;

    async fn alert_triggered(&self, alert: &SensorAlert) -> Result<(), AlertError>;

    async fn alert_normal(&self, alert: &SensorAlert) -> Result<(), AlertError>;

    async fn alert_profile_change(&self, profile: &Profile) -> Result<(), AlertError>;
}
