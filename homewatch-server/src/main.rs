//! Homewatch server
//!
//! Central node of the network: tracks registered nodes and sensor states,
//! forwards sensor events to the alert nodes, owns the system profile and
//! exposes everything over an authenticated REST API.

mod config;
mod health;
mod http;
mod mqtt;
mod registry;
mod state;

use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::registry::{NodeRegistry, SharedNodeRegistry};
use anyhow::{Context, Result};
use homewatch_core::telemetry::init_logging;
use homewatch_core::{MemoryStorage, MqttLink, Shutdown};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging("homewatch_server=info,homewatch_core=info");

    let config = Arc::new(load_config().await.context("Failed to load configuration")?);

    if let Some(dir) = config.storage_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data dir {}", dir.display()))?;
    }
    let storage = Arc::new(
        MemoryStorage::open(&config.storage_path)
            .await
            .with_context(|| format!("Failed to open storage {}", config.storage_path.display()))?,
    );

    let shutdown = Shutdown::new();
    let health = HealthTracker::new();
    let registry: SharedNodeRegistry = Arc::new(NodeRegistry::new(storage.clone()));

    let (link, inbound) = MqttLink::connect(&config.mqtt, mqtt::SERVER_USERNAME, shutdown.signal());
    let listener_task = mqtt::spawn_mqtt_listener(link.clone(), inbound, registry.clone(), health.clone());

    NodeRegistry::start_sensor_monitoring(
        registry.clone(),
        Duration::from_secs(config.sensor_timeout_secs),
        shutdown.signal(),
    );

    let app_state = AppState { storage: storage.clone(), config: config.clone(), health, link: Some(link.clone()) };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(config.http_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    if let Err(e) = link.disconnect().await {
        error!(error = %e, "MQTT disconnect failed");
    }
    shutdown.trigger();
    let _ = listener_task.await;

    storage.persist().await.context("Failed to persist storage")?;
    info!("server stopped");
    Ok(())
}
