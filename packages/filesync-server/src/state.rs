//! Shared server state.
//!
//! The composition root: every handler gets this via axum `State`. No
//! global singletons; main() builds one of these and hands it out.

use crate::auth::AuthKeys;
use crate::bus::EventBus;
use crate::engine::SyncEngine;
use crate::repository::Repository;
use crate::sessions::SessionManager;
use crate::storage::BlobStore;

/// Settings that reach request handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Storage quota assigned to new accounts, in bytes.
    pub default_quota: u64,
    /// Access token lifetime in seconds.
    pub access_token_ttl_secs: u64,
    /// Refresh token lifetime in days.
    pub refresh_token_ttl_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_quota: 10 * 1024 * 1024 * 1024,
            access_token_ttl_secs: 3600,
            refresh_token_ttl_days: 14,
        }
    }
}

/// Shared application state. Cheap to clone: everything inside is
/// reference counted.
#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub blobs: BlobStore,
    pub sessions: SessionManager,
    pub engine: SyncEngine,
    pub bus: EventBus,
    pub auth: AuthKeys,
    pub config: ServerConfig,
}
