use anyhow::Result;
use axum::Router;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    metadata_store::MetadataStore,
    object_store::{FsObjectStore, ObjectStore},
    staging::StagingArea,
    transfer::TransferWorker,
    transfer_queue::{TransferQueue, TransferQueueConfig},
    upload_service::UploadService,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadService>,
    pub db: Arc<SqlitePool>,
    pub staging_root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-relay with config: {:?}", cfg);

    // --- Ensure working directories exist ---
    for dir in [&cfg.staging_dir, &cfg.storage_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory and the database file if needed; SQLx will not
    // create either on its own with a plain URL.
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    if let Err(e) = fs::OpenOptions::new().create(true).append(true).open(db_path) {
        tracing::warn!("Failed to pre-create database file: {}", e);
    }

    let db: Arc<SqlitePool> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Apply schema (and exit early in migration mode) ---
    MetadataStore::apply_schema(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&cfg.storage_dir));
    store.ensure_bucket(&cfg.bucket).await?;
    tracing::info!("Bucket `{}` ready", cfg.bucket);

    let metadata = MetadataStore::new(db.clone());
    let staging = StagingArea::new(&cfg.staging_dir);

    let worker = TransferWorker::new(metadata.clone(), store);
    let queue = TransferQueue::new(
        worker,
        TransferQueueConfig {
            max_workers: cfg.transfer_workers,
            queue_capacity: cfg.queue_capacity,
            submit_wait: Duration::from_secs(5),
        },
    );

    let uploads = Arc::new(UploadService::new(
        metadata,
        staging.clone(),
        queue.clone(),
        cfg.bucket.clone(),
    ));

    // --- Build router ---
    let state = AppState {
        uploads,
        db,
        staging_root: staging.base_path().to_path_buf(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain queued and in-flight transfers before exiting.
    tracing::info!("Server stopped, draining transfer queue");
    queue.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}
