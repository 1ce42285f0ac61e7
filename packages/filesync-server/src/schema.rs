//! Database schema.
//!
//! Four logical entities back the sync engine: users, files, the append-only
//! version history, and the sync event log. Upload sessions are deliberately
//! *not* here: they are TTL-bounded scratch state kept in memory with their
//! chunk bytes staged on disk.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Accounts
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    -- Argon2 PHC string
    password_hash TEXT NOT NULL,
    -- Quota and usage in bytes
    storage_quota INTEGER NOT NULL,
    used_storage INTEGER NOT NULL DEFAULT 0,
    -- 'ACTIVE' or 'SUSPENDED'
    account_status TEXT NOT NULL DEFAULT 'ACTIVE',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

-- Files: one row per (user, path); deletes tombstone the row
CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    -- Relative to the user's sync root, forward-slash normalized
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    -- SHA-256 hex of the current content
    checksum TEXT NOT NULL,
    -- Current version vector, JSON encoded
    version_vector TEXT NOT NULL,
    -- PENDING | SYNCED | DELETED | ERROR
    sync_status TEXT NOT NULL,
    -- NONE | CONFLICT
    conflict_status TEXT NOT NULL DEFAULT 'NONE',
    created_at INTEGER NOT NULL,
    modified_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id),
    UNIQUE (user_id, file_path)
);
CREATE INDEX IF NOT EXISTS idx_files_user_path ON files(user_id, file_path);

-- Version history: append-only; exactly one current row per file
CREATE TABLE IF NOT EXISTS file_versions (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    -- Monotone per file
    version_number INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    -- Relative blob path under the storage base, forward-slash form
    storage_path TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    version_vector TEXT NOT NULL,
    created_by_client TEXT NOT NULL,
    -- Conflict versions are stored non-current
    is_current INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id)
);
CREATE INDEX IF NOT EXISTS idx_versions_file ON file_versions(file_id, version_number DESC);
CREATE INDEX IF NOT EXISTS idx_versions_current ON file_versions(file_id, is_current) WHERE is_current = 1;

-- Sync event log, queried ascending per user for catch-up
CREATE TABLE IF NOT EXISTS sync_events (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    file_id TEXT,
    -- CREATE | MODIFY | DELETE | CONFLICT
    event_type TEXT NOT NULL,
    -- Unix millis
    timestamp INTEGER NOT NULL,
    client_id TEXT NOT NULL,
    -- PENDING | COMPLETED | FAILED
    sync_status TEXT NOT NULL,
    file_path TEXT,
    checksum TEXT,
    file_size INTEGER,
    version_vector TEXT,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_events_user_time ON sync_events(user_id, timestamp);

-- Opaque refresh tokens, rotated on use and dropped on logout
CREATE TABLE IF NOT EXISTS refresh_tokens (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_refresh_user ON refresh_tokens(user_id);
"#;
