//! Asset Custody Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! asset-custody
//!
//! # Start with custom config
//! asset-custody --config /path/to/config.toml
//!
//! # Custom port, storage directory and log level
//! asset-custody --http-port 8096 --storage-dir /data/custody --log-level debug
//! ```

use anyhow::Context;
use asset_custody::services::events::spawn_logging_listener;
use asset_custody::{Config, CustodyDb, EventBus, HttpServer, ServiceDeps, Services};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "asset-custody")]
#[command(about = "Custody ledger for equipment, accessories and consumables")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ASSET_CUSTODY_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ASSET_CUSTODY_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "ASSET_CUSTODY_HTTP_PORT")]
    http_port: Option<u16>,

    /// Log filter directive, e.g. `debug` or `asset_custody=trace`
    #[arg(long)]
    log_level: Option<String>,

    /// Grant SITE_ADMIN to this user id on an empty deployment, then serve
    #[arg(long, env = "ASSET_CUSTODY_BOOTSTRAP_ADMIN")]
    bootstrap_admin: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let directive = match &args.log_level {
        Some(level) if !level.contains('=') => format!("asset_custody={}", level),
        Some(level) => level.clone(),
        None => "asset_custody=info".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    // Load config
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        "Starting asset-custody"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = Arc::new(
        CustodyDb::open(&config.database_path(), config.busy_timeout())
            .with_context(|| format!("opening {}", config.database_path().display()))?,
    );
    let events = Arc::new(EventBus::with_capacity(config.event_bus_capacity));
    let listener = spawn_logging_listener(events.clone());

    let deps = ServiceDeps::new(db, events).with_low_stock_notifications(config.low_stock_notifications);
    let services = Arc::new(Services::with_deps(deps));

    if let Some(admin) = &args.bootstrap_admin {
        match services.directory.bootstrap_site_admin(admin, admin) {
            Ok(_) => info!(user = %admin, "Site administrator created"),
            Err(e) => warn!(user = %admin, error = %e, "Skipping site administrator bootstrap"),
        }
    }

    let http_addr: SocketAddr = format!("{}:{}", config.bind_address, config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(services, http_addr));
    info!("HTTP API available at http://{}", http_addr);

    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    listener.abort();
    Ok(())
}
