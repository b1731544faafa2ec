use std::path::PathBuf;
use std::time::Duration;

use leasy_server::ServerConfig;
use leasy_store::Database;
use leasy_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() {
    let telemetry_config = TelemetryConfig::default();
    let snapshot_interval = telemetry_config.metrics_snapshot_interval_secs;
    let retention_days = telemetry_config.metrics_retention_days;
    let telemetry = init_telemetry(telemetry_config);

    tracing::info!("starting leasy chat server");

    // Database path
    let data_dir = dirs_home().join(".leasy").join("database");
    std::fs::create_dir_all(&data_dir).expect("failed to create database directory");
    let db_path = data_dir.join("chat.db");

    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let config = ServerConfig {
        port: std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080),
        ..Default::default()
    };

    let handle = match telemetry.metrics_arc() {
        Some(metrics) => {
            // Periodic metric snapshots with bounded retention
            let snapshots = metrics.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(snapshot_interval.max(1)));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = snapshots.snapshot() {
                        tracing::warn!(error = %e, "metrics snapshot failed");
                    }
                    let _ = snapshots.prune(retention_days);
                }
            });
            leasy_server::start_with_metrics(config, db, metrics).await
        }
        None => leasy_server::start(config, db).await,
    }
    .expect("failed to start server");

    tracing::info!(port = handle.port, "chat server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
