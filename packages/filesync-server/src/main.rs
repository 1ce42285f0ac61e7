//! Filesync server
//!
//! The synchronization core of a multi-client file-sync service:
//!
//! 1. **Causal reconciliation**: per-file version vectors classify every
//!    submission as create, accept, stale, or conflict; concurrent edits
//!    are surfaced, never silently merged.
//!
//! 2. **Bounded transfer**: large files move through resumable chunk upload
//!    sessions with per-chunk and whole-file integrity checks; downloads
//!    honor HTTP `Range` requests.
//!
//! 3. **Live fan-out**: accepted changes and detected conflicts stream to
//!    the user's other clients over a per-user event socket.

mod auth;
mod bus;
mod download;
mod dto;
mod engine;
mod error;
mod files_api;
mod repository;
mod schema;
mod sessions;
mod state;
mod storage;
mod upload_api;
mod ws;

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::Method;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use auth::AuthKeys;
use bus::EventBus;
use engine::SyncEngine;
use repository::Repository;
use sessions::{SessionConfig, SessionManager};
use state::{AppState, ServerConfig};
use storage::BlobStore;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "filesync-server", version, about = "Filesync synchronization server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "FILESYNC_PORT")]
    port: u16,

    /// Directory for version blobs and chunk staging
    #[arg(long, default_value = "./data/storage", env = "FILESYNC_STORAGE_DIR")]
    storage_dir: PathBuf,

    /// SQLite database path
    #[arg(long, default_value = "./data/filesync.db", env = "FILESYNC_DATABASE")]
    database: PathBuf,

    /// Secret used to sign access tokens
    #[arg(long, env = "FILESYNC_JWT_SECRET")]
    jwt_secret: String,

    /// Storage quota for new accounts, in MiB
    #[arg(long, default_value_t = 10 * 1024, env = "FILESYNC_QUOTA_MIB")]
    quota_mib: u64,

    /// Upload session TTL in hours
    #[arg(long, default_value_t = 24, env = "FILESYNC_SESSION_TTL_HOURS")]
    session_ttl_hours: u64,

    /// Finished-session retention in hours
    #[arg(long, default_value_t = 24, env = "FILESYNC_SESSION_RETENTION_HOURS")]
    session_retention_hours: u64,

    /// Concurrent upload sessions allowed per user
    #[arg(long, default_value_t = 8, env = "FILESYNC_MAX_SESSIONS_PER_USER")]
    max_sessions_per_user: usize,

    /// Sweep interval for sessions and stale subscriptions, in seconds
    #[arg(long, default_value_t = 60, env = "FILESYNC_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Largest accepted request body, in MiB (bounds direct uploads and
    /// individual chunks)
    #[arg(long, default_value_t = 64, env = "FILESYNC_MAX_BODY_MIB")]
    max_body_mib: usize,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filesync_server=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.database.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(error = %e, "Failed to create database directory");
            std::process::exit(1);
        }
    }

    let repo = match Repository::open(args.database.to_str()) {
        Ok(repo) => repo,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open database");
            std::process::exit(1);
        }
    };

    let blobs = BlobStore::new(&args.storage_dir);
    let bus = EventBus::new();
    let sessions = SessionManager::new(
        blobs.clone(),
        SessionConfig {
            ttl: Duration::from_secs(args.session_ttl_hours * 3600),
            retention: Duration::from_secs(args.session_retention_hours * 3600),
            max_active_per_user: args.max_sessions_per_user,
        },
    );
    let engine = SyncEngine::new(repo.clone(), blobs.clone(), bus.clone());

    let app_state = AppState {
        repo,
        blobs,
        sessions: sessions.clone(),
        engine,
        bus: bus.clone(),
        auth: AuthKeys::new(&args.jwt_secret),
        config: ServerConfig {
            default_quota: args.quota_mib * 1024 * 1024,
            ..ServerConfig::default()
        },
    };

    // ── Background sweeper ────────────────────────────────────────────────

    let sweep_interval = args.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sessions.sweep();
            bus.reap_stale();
        }
    });

    // ── Routers ───────────────────────────────────────────────────────────

    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/sync/ws", get(ws::ws_handler));

    let protected = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/files/", get(files_api::list_files))
        .route("/files/upload", post(files_api::upload))
        .route("/files/events", get(files_api::events_since))
        .route(
            "/files/:file_id",
            put(files_api::update).delete(files_api::delete_file),
        )
        .route("/files/:file_id/download", get(download::download_full))
        .route(
            "/files/:file_id/download-chunked",
            get(download::download_chunked),
        )
        .route("/files/:file_id/metadata", get(files_api::metadata))
        .route("/files/:file_id/versions", get(files_api::versions))
        .route(
            "/files/upload/initiate-chunked",
            post(upload_api::initiate),
        )
        .route("/files/upload/chunk", post(upload_api::upload_chunk))
        .route("/files/upload/status/:session_id", get(upload_api::status))
        .route(
            "/files/upload/cancel/:session_id",
            delete(upload_api::cancel),
        )
        .route("/files/upload/sessions", get(upload_api::sessions))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            auth::require_auth,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", public.merge(protected))
        .layer(DefaultBodyLimit::max(args.max_body_mib * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!(addr = addr.as_str(), "Filesync server starting");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, addr = addr.as_str(), "Failed to bind");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

// ── Service Endpoints ─────────────────────────────────────────────────────────

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "filesync-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "subscribers": state.bus.subscriber_count(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.default_quota, 10 * 1024 * 1024 * 1024);
        assert_eq!(config.access_token_ttl_secs, 3600);
        assert_eq!(config.refresh_token_ttl_days, 14);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["filesync-server", "--jwt-secret", "s3cret"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.session_ttl_hours, 24);
        assert_eq!(args.sweep_interval_secs, 60);
        assert_eq!(args.max_sessions_per_user, 8);
    }
}
