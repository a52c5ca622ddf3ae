//! Configuration and HTTP status API for the vaultsync watcher.

use anyhow::{Context, Result};
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, sync::Arc};
use vaultsync_adapter::{HttpSinkConfig, LockedIds};
use vaultsync_storage::RelationMap;
use vaultsync_sync::{Engine, EngineConfig, EngineStats, RegistrySpec, SupervisorState};

/// Default port of the status endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 4010;

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Entity kinds, junctions and ignored tables.
    pub registry: RegistrySpec,
    /// Relations the SQLite store resolves when reloading records.
    pub relations: RelationMap,
    pub engine: EngineConfig,
    pub sink: HttpSinkConfig,
    /// Parks failed deliveries in this SQLite file when set.
    pub outbox_path: Option<PathBuf>,
}

impl WatcherConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// Deployment values taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub sink_url: Option<String>,
    /// Directory holding `mappings.db`.
    pub mapping_db_path: PathBuf,
    /// Directory of schema mapping files.
    pub schemas_path: PathBuf,
    pub source_db: Option<PathBuf>,
    pub http_port: u16,
}

impl Deployment {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads deployment values through `get`, falling back to defaults for
    /// unset or blank variables.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let http_port = match var("VAULTSYNC_HTTP_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("Invalid VAULTSYNC_HTTP_PORT: {port}"))?,
            None => DEFAULT_HTTP_PORT,
        };
        Ok(Self {
            sink_url: var("VAULTSYNC_SINK_URL"),
            mapping_db_path: var("VAULTSYNC_MAPPING_DB_PATH")
                .map_or_else(|| PathBuf::from("data"), PathBuf::from),
            schemas_path: var("VAULTSYNC_SCHEMAS_PATH")
                .map_or_else(|| PathBuf::from("schemas"), PathBuf::from),
            source_db: var("VAULTSYNC_SOURCE_DB").map(PathBuf::from),
            http_port,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub state: SupervisorState,
}

/// Shared by the status and lock handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// The same set the engine's echo guard reads.
    pub locks: LockedIds,
}

async fn health_handler(State(app): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let state = app.engine.supervisor_state();
    let (code, status) = match state {
        SupervisorState::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
        _ => (StatusCode::OK, "ok"),
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            state,
        }),
    )
}

async fn stats_handler(State(app): State<AppState>) -> Json<EngineStats> {
    Json(app.engine.stats())
}

async fn list_locks_handler(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.locks.snapshot())
}

/// Called by the sink before it writes `id` locally, so the write is not
/// mirrored back to it.
async fn lock_handler(State(app): State<AppState>, UrlPath(id): UrlPath<String>) -> StatusCode {
    app.locks.lock(id);
    StatusCode::NO_CONTENT
}

async fn unlock_handler(State(app): State<AppState>, UrlPath(id): UrlPath<String>) -> StatusCode {
    if app.locks.unlock(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Build the status and lock API router. `locks` must be the set handed to
/// the engine builder.
pub fn build_router(engine: Arc<Engine>, locks: LockedIds) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/locks", get(list_locks_handler))
        .route("/locks/{id}", post(lock_handler).delete(unlock_handler))
        .with_state(AppState { engine, locks })
}
