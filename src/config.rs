use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub staging_dir: String,
    pub storage_dir: String,
    pub bucket: String,
    pub transfer_workers: usize,
    pub queue_capacity: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Asynchronous upload relay API")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides UPLOAD_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for transient staged payloads (overrides UPLOAD_RELAY_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Root directory of the object store (overrides UPLOAD_RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Target bucket for completed uploads (overrides UPLOAD_RELAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Maximum concurrent background transfers (overrides UPLOAD_RELAY_TRANSFER_WORKERS)
    #[arg(long)]
    pub transfer_workers: Option<usize>,

    /// Capacity of the pending-transfer queue (overrides UPLOAD_RELAY_QUEUE_CAPACITY)
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("UPLOAD_RELAY_PORT", 8080u16)?;
        let env_db = env::var("UPLOAD_RELAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_staging =
            env::var("UPLOAD_RELAY_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_storage =
            env::var("UPLOAD_RELAY_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_bucket = env::var("UPLOAD_RELAY_BUCKET").unwrap_or_else(|_| "uploads".into());
        let env_workers = parse_env("UPLOAD_RELAY_TRANSFER_WORKERS", 10usize)?;
        let env_queue = parse_env("UPLOAD_RELAY_QUEUE_CAPACITY", 100usize)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            bucket: args.bucket.unwrap_or(env_bucket),
            transfer_workers: args.transfer_workers.unwrap_or(env_workers),
            queue_capacity: args.queue_capacity.unwrap_or(env_queue),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
