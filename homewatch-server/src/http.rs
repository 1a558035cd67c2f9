use crate::config::ServerConfig;
use crate::health::{HealthTracker, ServerHealth};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use homewatch_core::storage::{NodeInfo, SensorInfo, SystemSnapshot, PROFILE_OPTION};
use homewatch_core::transport::topics;
use homewatch_core::{Envelope, MemoryStorage, MqttLink, Profile, Storage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const API_KEY_ENV: &str = "HOMEWATCH_API_KEY";

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var(API_KEY_ENV).unwrap_or_default();
    if expected.is_empty() {
        warn!("{API_KEY_ENV} not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<MemoryStorage>,
    pub config: Arc<ServerConfig>,
    pub health: HealthTracker,
    /// `None` only in tests; profile changes are then stored but not broadcast.
    pub link: Option<MqttLink>,
}

#[derive(Debug, Serialize, PartialEq)]
struct AlertLevelView {
    level: i64,
    name: Option<String>,
    used_by_sensors: bool,
    used_by_alerts: bool,
}

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    id: i64,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/system", get(get_system))
        .route("/nodes", get(get_nodes))
        .route("/sensors", get(get_sensors))
        .route("/alert-levels", get(get_alert_levels))
        .route("/profile", get(get_profile).post(set_profile))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<ServerHealth> {
    Json(app.health.get_health(app.storage.as_ref()))
}

// GET /system
async fn get_system(State(app): State<AppState>) -> Json<SystemSnapshot> {
    Json(app.storage.get_system_snapshot())
}

// GET /nodes
async fn get_nodes(State(app): State<AppState>) -> Json<Vec<NodeInfo>> {
    Json(app.storage.get_system_snapshot().nodes)
}

// GET /sensors
async fn get_sensors(State(app): State<AppState>) -> Json<Vec<SensorInfo>> {
    Json(app.storage.get_system_snapshot().sensors)
}

// GET /alert-levels (configured names plus every level in use)
async fn get_alert_levels(State(app): State<AppState>) -> Json<Vec<AlertLevelView>> {
    Json(alert_levels(&app))
}

fn alert_levels(app: &AppState) -> Vec<AlertLevelView> {
    let sensor_levels = app.storage.get_all_sensors_alert_levels();
    let alert_levels = app.storage.get_all_alerts_alert_levels();
    let configured = app.config.alert_levels.iter().map(|l| l.level);
    let all: BTreeSet<i64> = sensor_levels.iter().chain(alert_levels.iter()).copied().chain(configured).collect();

    all.into_iter()
        .map(|level| AlertLevelView {
            level,
            name: app.config.alert_level_name(level).map(str::to_string),
            used_by_sensors: sensor_levels.contains(&level),
            used_by_alerts: alert_levels.contains(&level),
        })
        .collect()
}

fn current_profile(app: &AppState) -> Result<Profile, StatusCode> {
    let id = app.storage.get_option_by_type(PROFILE_OPTION).map(|option| option.value).unwrap_or(0);
    app.config.profile(id).cloned().ok_or(StatusCode::NOT_FOUND)
}

// GET /profile
async fn get_profile(State(app): State<AppState>) -> Result<Json<Profile>, StatusCode> {
    current_profile(&app).map(Json)
}

// POST /profile {"id": 1}
async fn set_profile(
    State(app): State<AppState>,
    Json(request): Json<ProfileRequest>,
) -> Result<Json<Profile>, StatusCode> {
    let profile = app.config.profile(request.id).cloned().ok_or(StatusCode::NOT_FOUND)?;

    app.storage.update_option(PROFILE_OPTION, profile.id).map_err(|e| {
        error!(error = %e, "failed to store profile");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if let Err(e) = app.storage.persist().await {
        error!(error = %e, "failed to persist storage");
    }

    if let Some(link) = &app.link {
        if let Err(e) = link.publish(topics::PROFILE, &Envelope::ProfileChange(profile.clone())).await {
            error!(error = %e, "failed to publish profile change");
            return Err(StatusCode::BAD_GATEWAY);
        }
    }
    info!(profile = profile.id, name = %profile.name, "profile changed");
    Ok(Json(profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertLevelConfig;
    use homewatch_core::storage::{AlertDescriptor, NodeDescriptor, NodeType};

    fn app_state() -> AppState {
        let config = ServerConfig {
            profiles: vec![Profile { id: 0, name: "home".into() }, Profile { id: 1, name: "away".into() }],
            alert_levels: vec![AlertLevelConfig { level: 1, name: "intrusion".into() }],
            ..ServerConfig::default()
        };
        AppState {
            storage: Arc::new(MemoryStorage::new()),
            config: Arc::new(config),
            health: HealthTracker::new(),
            link: None,
        }
    }

    #[tokio::test]
    async fn test_profile_change_is_stored() {
        let app = app_state();
        assert_eq!(current_profile(&app).unwrap().name, "home");

        let Json(profile) = set_profile(State(app.clone()), Json(ProfileRequest { id: 1 })).await.unwrap();
        assert_eq!(profile.name, "away");
        assert_eq!(app.storage.get_option_by_type(PROFILE_OPTION).unwrap().value, 1);
        assert_eq!(current_profile(&app).unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_not_found() {
        let app = app_state();
        let result = set_profile(State(app.clone()), Json(ProfileRequest { id: 9 })).await;
        assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
        assert_eq!(app.storage.get_option_by_type(PROFILE_OPTION).unwrap().value, 0);
    }

    #[test]
    fn test_alert_levels_merge_config_and_storage() {
        let app = app_state();
        let node = NodeDescriptor {
            username: "siren".into(),
            hostname: "pi".into(),
            node_type: NodeType::Alert,
            instance: "homewatch-alert".into(),
            version: "1.0.0".into(),
            persistent: false,
        };
        app.storage.add_node(&node).unwrap();
        let alert = AlertDescriptor { client_alert_id: 1, description: "siren".into(), alert_levels: BTreeSet::from([1, 4]) };
        app.storage.add_alerts("siren", &[alert]).unwrap();

        let levels = alert_levels(&app);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].name.as_deref(), Some("intrusion"));
        assert!(levels[0].used_by_alerts);
        assert!(!levels[0].used_by_sensors);
        assert_eq!(levels[1], AlertLevelView { level: 4, name: None, used_by_sensors: false, used_by_alerts: true });
    }
}
