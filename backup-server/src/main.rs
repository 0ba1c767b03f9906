//! infra-core - backup console entry point
//!
//! Serves the plan, snapshot and restore API over a deduplicated block store
//! and runs the snapshot and scrub schedules.

mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::scheduler::SnapshotScheduler;
use crate::state::AppState;
use backup_engine::utils::logger;
use backup_engine::BackupEngine;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for cancelled tasks to record their outcome
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory for the database, block store and manifests (overrides DATA_DIR)
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Engine TOML configuration file (overrides ENGINE_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    engine_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env();
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.data_dir {
        config.db_path = dir.join("infra-core.db");
        config.data_dir = dir;
    }
    if let Some(path) = args.engine_config {
        config.engine_config = Some(path);
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logger::init(&config.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), port = config.port, "Starting infra-core");

    std::fs::create_dir_all(&config.data_dir)?;

    let pool = create_pool(&config.db_path)?;
    migrate(&pool)?;

    // Opening the engine rebuilds the block index from disk
    let engine_config = config.engine_config()?;
    let engine = tokio::task::spawn_blocking(move || BackupEngine::open(engine_config)).await??;
    tracing::info!(
        blocks = engine.store.len(),
        store = %engine.config.store.dir.display(),
        "Block store ready"
    );

    let state = Arc::new(AppState::new(pool, config.clone(), engine));

    let scheduler = match SnapshotScheduler::new(state.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_jobs().await {
                tracing::warn!(error = %e, "Failed to register scheduler jobs");
            }
            if let Err(e) = s.start().await {
                tracing::warn!(error = %e, "Failed to start scheduler");
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to create scheduler");
            None
        }
    };

    let app = routes::create_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    // In-flight tasks start cancelling as soon as the signal arrives, while HTTP drains
    let watcher = state.clone();
    tokio::spawn(async move {
        watcher.shutdown.cancelled().await;
        watcher.engine.tasks.cancel_all();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    tracing::info!("Shutting down...");
    state.shutdown.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!(error = %e, "Scheduler shutdown error");
        }
    }

    drain_tasks(&state).await;

    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

/// Give cancelled snapshots and restores time to record their outcome.
async fn drain_tasks(state: &AppState) {
    let in_flight = state.engine.tasks.running_count();
    if in_flight == 0 {
        return;
    }
    tracing::info!(tasks = in_flight, "Waiting for cancelled tasks");
    state.engine.tasks.cancel_all();

    let deadline = tokio::time::Instant::now() + TASK_DRAIN_TIMEOUT;
    while state.engine.tasks.running_count() > 0 {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                tasks = state.engine.tasks.running_count(),
                "Tasks still running at shutdown deadline"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!("All tasks stopped");
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
