//! vaultsync watcher
//!
//! Observes commits on a SQLite system of record and mirrors every synced
//! entity change to a webhook sink, skipping echoes of the sink's own writes.
//!
//! Usage:
//!   vaultsync-watcher --config vaultsync.json --source-db app.db
//!
//! Deployment values come from the environment (`VAULTSYNC_SINK_URL`,
//! `VAULTSYNC_MAPPING_DB_PATH`, `VAULTSYNC_SCHEMAS_PATH`,
//! `VAULTSYNC_SOURCE_DB`, `VAULTSYNC_HTTP_PORT`); flags win over them.

use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vaultsync_adapter::{HttpSink, LockedIds, MappingDb, SchemaRegistry};
use vaultsync_storage::SqliteRecordStore;
use vaultsync_sync::observer::commit_hook::SqliteCommitObserver;
use vaultsync_sync::{DeliveryOutbox, Engine, EntityRegistry};
use vaultsync_watcher::{build_router, Deployment, WatcherConfig};

#[derive(Parser, Debug)]
#[command(name = "vaultsync-watcher")]
#[command(about = "Mirrors SQLite changes to a webhook sink")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "vaultsync.json")]
    config: PathBuf,

    /// SQLite system of record
    #[arg(long)]
    source_db: Option<PathBuf>,

    /// HTTP port for the status and lock endpoints
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("vaultsync watcher starting...");
    let mut config = WatcherConfig::load(&args.config)?;
    let deployment = Deployment::from_env()?;
    if let Some(url) = deployment.sink_url.clone() {
        config.sink.base_url = url;
    }
    let source_db = args
        .source_db
        .or(deployment.source_db.clone())
        .context("No source database: pass --source-db or set VAULTSYNC_SOURCE_DB")?;
    let http_port = args.port.unwrap_or(deployment.http_port);

    let registry = EntityRegistry::from_spec(
        config.registry.clone(),
        config.engine.default_consistency_delay(),
    )
    .context("Invalid entity registry")?;
    let store = Arc::new(
        SqliteRecordStore::open(&source_db, config.relations.clone())
            .with_context(|| format!("Failed to open {}", source_db.display()))?,
    );
    let schemas = Arc::new(SchemaRegistry::load_dir(&deployment.schemas_path).with_context(
        || format!("Failed to load schema mappings from {}", deployment.schemas_path.display()),
    )?);
    if schemas.is_empty() {
        warn!("No schema mappings loaded, nothing will be forwarded");
    }
    let mappings = MappingDb::open(&deployment.mapping_db_path)
        .context("Failed to open mapping database")?;
    let sink = HttpSink::new(config.sink.clone(), schemas)?.with_mappings(mappings.clone());

    let locks = LockedIds::default();
    let mut builder = Engine::builder(registry, store.clone(), Arc::new(sink))
        .config(config.engine.clone())
        .locks(Arc::new(locks.clone()))
        .global_ids(Arc::new(mappings));
    if let Some(path) = &config.outbox_path {
        let outbox = DeliveryOutbox::open(path)
            .with_context(|| format!("Failed to open outbox {}", path.display()))?;
        builder = builder.outbox(outbox);
    }
    let engine = Arc::new(builder.build());
    engine
        .start(Box::new(SqliteCommitObserver::new(store)))
        .context("Failed to start engine")?;

    if config.outbox_path.is_some() {
        let report = engine.replay_outbox().await?;
        info!(
            delivered = report.delivered,
            failed = report.failed,
            superseded = report.superseded,
            skipped = report.skipped,
            "outbox replayed"
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{http_port}"))
        .await
        .with_context(|| format!("Failed to bind HTTP port {http_port}"))?;
    info!(
        source = %source_db.display(),
        sink = %config.sink.base_url,
        http_port,
        "watcher running"
    );

    let app = build_router(Arc::clone(&engine), locks);
    tokio::select! {
        served = axum::serve(listener, app) => served.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    engine.stop().await;
    Ok(())
}
