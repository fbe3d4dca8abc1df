//! netsensor - network health sensor agent
//!
//! Cycles through the configured wireless and wired networks, measures
//! association, DHCP, DNS and per-service reachability on each, and exposes
//! the results as Prometheus metrics alongside a small JSON API.

mod config;
mod db;
mod incident;
mod metrics;
mod probe;
mod scheduler;
mod web;
mod wifi;

use config::{load_sensor_config, SensorConfig, ServerConfig};
use db::Store;
use incident::{IncidentStore, IncidentTracker};
use metrics::PrometheusSink;
use probe::SystemProbe;
use scheduler::{spawn_batch_writer, RetentionManager, Scheduler, SystemClock};
use web::Server;

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_RETRY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netsensor=info".parse()?))
        .init();

    let server_cfg = ServerConfig::load();
    let sensor_cfg = wait_for_networks(&server_cfg).await;
    tracing::info!(
        "Starting netsensor {} on port {} with {} networks",
        sensor_cfg.sensor_name,
        sensor_cfg.metrics_port,
        sensor_cfg.networks.len()
    );

    let sink = Arc::new(PrometheusSink::new()?);

    // Initialize database
    let store = Arc::new(Store::new(&sensor_cfg.results.db_path)?);
    tracing::info!("Using results database at {}", sensor_cfg.results.db_path);
    let results = spawn_batch_writer(store.clone());

    let retention = RetentionManager::new(store.clone(), sensor_cfg.results.retention_days);
    retention.start();

    let incident_store = IncidentStore::new(&sensor_cfg.incidents.state_path);
    let incidents = IncidentTracker::new(
        incident_store.clone(),
        sink.clone(),
        sensor_cfg.incidents.max_events_per_type,
    );

    let provider = Arc::new(SystemProbe::new()?);
    let port = sensor_cfg.metrics_port;
    let scheduler = Scheduler::new(sensor_cfg, provider, Arc::new(SystemClock), sink.clone(), incidents)
        .with_results(results);
    tokio::spawn(scheduler.run());

    let server = Server::new(port, sink, store, incident_store);
    server.start().await?;

    Ok(())
}

/// Load the sensor file until it names at least one network.
async fn wait_for_networks(server_cfg: &ServerConfig) -> SensorConfig {
    loop {
        match load_sensor_config(&server_cfg.config_path) {
            Ok(mut cfg) if !cfg.networks.is_empty() => {
                server_cfg.apply(&mut cfg);
                return cfg;
            }
            Ok(_) => tracing::error!(
                "No wifi or wired networks in {}; retrying in {}s",
                server_cfg.config_path,
                CONFIG_RETRY_INTERVAL.as_secs()
            ),
            Err(e) => tracing::error!(
                "Failed to load {}: {}; retrying in {}s",
                server_cfg.config_path,
                e,
                CONFIG_RETRY_INTERVAL.as_secs()
            ),
        }
        tokio::time::sleep(CONFIG_RETRY_INTERVAL).await;
    }
}
