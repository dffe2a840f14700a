//! courier worker process.
//!
//! Connects to PostgreSQL, applies migrations and runs one [`JobWorker`]
//! until Ctrl-C. Run several processes against the same database to scale
//! out; they coordinate through the `job_queue` table alone.

use courier_db::{log_pool_metrics, Database, PoolConfig};
use courier_jobs::{recv_event, NoOpHandler, WorkerBuilder, WorkerConfig, WorkerEvent};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
    //   RUST_LOG    - standard env filter (default: "courier_jobs=info,courier_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "courier_jobs=info,courier_db=info".into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("courier-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let config = WorkerConfig::from_env();
    let pool_config = PoolConfig::from_env()?.sized_for_batch(config.batch_size);

    let db = Database::connect_with_config(&pool_config).await?;
    db.migrate().await?;
    log_pool_metrics(db.pool());

    info!(
        worker_id = %config.worker_id,
        enabled = config.enabled,
        "Worker configuration loaded"
    );

    let worker = WorkerBuilder::new(db.job_store())
        .with_config(config)
        .with_handler(NoOpHandler::new("noop"))
        .build();
    let handle = worker.start();

    let mut events = handle.events();
    let pool = db.pool().clone();
    tokio::spawn(async move {
        while let Some(event) = recv_event(&mut events).await {
            match event {
                WorkerEvent::ClaimFailed { .. } => log_pool_metrics(&pool),
                WorkerEvent::WorkerStopped { .. } => break,
                _ => {}
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "Worker already stopped");
    }
    handle.join().await?;

    info!("courier worker exited");
    Ok(())
}
