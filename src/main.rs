//! Unified Inventory Synchronizer - main entry point.
//!
//! Wires the pipeline together: HTTP server (webhook + queries), the
//! Marketplace B poller, the worker pool, and queue maintenance, all sharing
//! one shutdown token. SIGTERM/SIGINT stops intake first, then drains
//! in-flight work.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inventory_sync::config::Config;
use inventory_sync::ingest::{Poller, PollerConfig};
use inventory_sync::lock::{LockConfig, LockManager};
use inventory_sync::queue::{self, JobQueue, QueueConfig};
use inventory_sync::repo::{Repository, schema};
use inventory_sync::server::{AppState, build_router};
use inventory_sync::worker::{WorkerConfig, WorkerPool};

/// Tick interval for queue maintenance (stall reclaim + retention sweep).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Pool sizes for the coordination subsystems. Kept separate from the main
/// repository pool so queue polling cannot starve lock operations.
const QUEUE_POOL_SIZE: u32 = 5;
const LOCK_POOL_SIZE: u32 = 5;
const CURSOR_POOL_SIZE: u32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inventory_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        marketplace_b_api = %config.marketplace_b_api,
        "Starting inventory synchronizer"
    );

    // One pool per subsystem, all against the same database.
    let repo_pool = build_pool(&config, config.db_max_connections).await;
    let queue_pool = build_pool(&config, QUEUE_POOL_SIZE).await;
    let lock_pool = build_pool(&config, LOCK_POOL_SIZE).await;
    let cursor_pool = build_pool(&config, CURSOR_POOL_SIZE).await;

    // Schema must exist before anything serves.
    schema::ensure_schema(&repo_pool)
        .await
        .expect("Schema bootstrap failed");

    let repository = Repository::new(repo_pool);
    let job_queue = JobQueue::new(queue_pool, QueueConfig::default());
    let lock_manager = LockManager::new(lock_pool, LockConfig::DEFAULT);
    let poller = Poller::new(
        PollerConfig::new(&config.marketplace_b_api, &config.marketplace_b_api_key),
        job_queue.clone(),
        cursor_pool,
    );
    let worker_pool = WorkerPool::new(
        job_queue.clone(),
        repository.clone(),
        lock_manager,
        WorkerConfig::default(),
    );

    let shutdown = CancellationToken::new();

    let maintenance_task = tokio::spawn(queue::maintenance_loop(
        job_queue.clone(),
        MAINTENANCE_INTERVAL,
        shutdown.clone(),
    ));
    let poller_task = tokio::spawn(poller.clone().run(shutdown.clone()));
    let worker_task = tokio::spawn(worker_pool.run(shutdown.clone()));

    let app_state = AppState::new(
        config.marketplace_a_secret.clone(),
        job_queue,
        repository,
        poller,
    );
    let app = build_router(app_state);

    tracing::info!("Listening on {}", config.listen_addr);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal(shutdown.clone()))
        .await
        .expect("Server failed");

    // The server has stopped accepting; drain in-flight work. Jobs that do
    // not finish in time are redelivered after their lease expires.
    tracing::info!("Draining workers");
    for task in [worker_task, poller_task, maintenance_task] {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked during drain");
        }
    }

    tracing::info!("Shutdown complete");
}

async fn build_pool(config: &Config, max_connections: u32) -> sqlx::PgPool {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .idle_timeout(config.db_idle_timeout)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database")
}

/// Resolves when SIGTERM or SIGINT arrives, cancelling the shared token so
/// every loop winds down cooperatively.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("SIGINT received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }

    shutdown.cancel();
}
