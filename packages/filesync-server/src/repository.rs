//! Persistence layer.
//!
//! SQLite behind a single connection. All multi-row mutations belonging to
//! one sync decision go through the `apply_*` methods, each of which is one
//! transaction; the transaction boundary is one decision-engine call, so a
//! failure leaves no partial rows.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;

use filesync_core::protocol::{ConflictStatus, EventStatus, SyncEventType, SyncStatus};
use filesync_core::VersionVector;

use crate::error::{ApiError, ApiResult};
use crate::schema;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub storage_quota: u64,
    pub used_storage: u64,
    pub account_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub user_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub checksum: String,
    pub version_vector: VersionVector,
    pub sync_status: SyncStatus,
    pub conflict_status: ConflictStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FileVersionRecord {
    pub id: String,
    pub file_id: String,
    pub version_number: i64,
    pub checksum: String,
    pub storage_path: String,
    pub file_size: u64,
    pub version_vector: VersionVector,
    pub created_by_client: String,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncEventRecord {
    pub id: String,
    pub user_id: String,
    pub file_id: Option<String>,
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    pub client_id: String,
    pub sync_status: EventStatus,
    pub file_path: Option<String>,
    pub checksum: Option<String>,
    pub file_size: Option<u64>,
    pub version_vector: Option<VersionVector>,
}

// ── Repository ────────────────────────────────────────────────────────────────

/// The repository handle. Cheap to clone.
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    /// Open or create a database. `None` gives an in-memory database for
    /// tests.
    pub fn open(path: Option<&str>) -> ApiResult<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };

        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> ApiResult<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )?;
                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    // ========================================================================
    // USERS
    // ========================================================================

    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        storage_quota: u64,
    ) -> ApiResult<UserRecord> {
        let conn = self.conn.lock();
        let user = UserRecord {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            storage_quota,
            used_storage: 0,
            account_status: "ACTIVE".to_string(),
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, storage_quota, used_storage, account_status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.storage_quota as i64,
                user.used_storage as i64,
                user.account_status,
                user.created_at.timestamp_millis(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _)
                if f.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiError::Validation("username or email already registered".into())
            }
            other => other.into(),
        })?;

        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> ApiResult<Option<UserRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT id, username, email, password_hash, storage_quota, used_storage, account_status, created_at
             FROM users WHERE username = ?",
            params![username],
            row_to_user,
        );
        optional(result)
    }

    pub fn find_user_by_id(&self, user_id: &str) -> ApiResult<Option<UserRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT id, username, email, password_hash, storage_quota, used_storage, account_status, created_at
             FROM users WHERE id = ?",
            params![user_id],
            row_to_user,
        );
        optional(result)
    }

    // ========================================================================
    // FILES
    // ========================================================================

    pub fn find_file_by_path(&self, user_id: &str, file_path: &str) -> ApiResult<Option<FileRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("{} WHERE user_id = ? AND file_path = ?", SELECT_FILE),
            params![user_id, file_path],
            row_to_raw_file,
        );
        optional(result)?.map(FileRecord::try_from).transpose()
    }

    pub fn find_file_by_id(&self, file_id: &str) -> ApiResult<Option<FileRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("{} WHERE id = ?", SELECT_FILE),
            params![file_id],
            row_to_raw_file,
        );
        optional(result)?.map(FileRecord::try_from).transpose()
    }

    /// All non-tombstoned files for a user, newest first.
    pub fn list_files(&self, user_id: &str) -> ApiResult<Vec<FileRecord>> {
        self.query_files(
            &format!(
                "{} WHERE user_id = ? AND sync_status != 'DELETED' ORDER BY modified_at DESC",
                SELECT_FILE
            ),
            user_id,
        )
    }

    /// All files including tombstones, for reconciliation.
    pub fn list_files_with_tombstones(&self, user_id: &str) -> ApiResult<Vec<FileRecord>> {
        self.query_files(
            &format!("{} WHERE user_id = ? ORDER BY modified_at DESC", SELECT_FILE),
            user_id,
        )
    }

    fn query_files(&self, sql: &str, user_id: &str) -> ApiResult<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![user_id], row_to_raw_file)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(FileRecord::try_from(row?)?);
        }
        Ok(files)
    }

    // ========================================================================
    // VERSIONS
    // ========================================================================

    pub fn list_versions(&self, file_id: &str) -> ApiResult<Vec<FileVersionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE file_id = ? ORDER BY version_number ASC",
            SELECT_VERSION
        ))?;
        let rows = stmt.query_map(params![file_id], row_to_raw_version)?;

        let mut versions = Vec::new();
        for row in rows {
            versions.push(FileVersionRecord::try_from(row?)?);
        }
        Ok(versions)
    }

    pub fn find_version(&self, version_id: &str) -> ApiResult<Option<FileVersionRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("{} WHERE id = ?", SELECT_VERSION),
            params![version_id],
            row_to_raw_version,
        );
        optional(result)?.map(FileVersionRecord::try_from).transpose()
    }

    /// The single current version of a file.
    pub fn current_version(&self, file_id: &str) -> ApiResult<Option<FileVersionRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            &format!("{} WHERE file_id = ? AND is_current = 1", SELECT_VERSION),
            params![file_id],
            row_to_raw_version,
        );
        optional(result)?.map(FileVersionRecord::try_from).transpose()
    }

    pub fn max_version_number(&self, file_id: &str) -> ApiResult<i64> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(version_number) FROM file_versions WHERE file_id = ?",
            params![file_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }

    // ========================================================================
    // EVENTS
    // ========================================================================

    /// Events for a user since a timestamp, ascending.
    pub fn sync_events_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> ApiResult<Vec<SyncEventRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ? AND timestamp > ? ORDER BY timestamp ASC",
            SELECT_EVENT
        ))?;
        let rows = stmt.query_map(
            params![user_id, since.timestamp_millis()],
            row_to_raw_event,
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(SyncEventRecord::try_from(row?)?);
        }
        Ok(events)
    }

    /// Append a standalone event outside a sync transaction.
    pub fn append_sync_event(&self, event: &SyncEventRecord) -> ApiResult<()> {
        let conn = self.conn.lock();
        insert_event(&conn, event)
    }

    // ========================================================================
    // SYNC TRANSACTIONS
    // ========================================================================
    // One method per decision-engine outcome; each is a single transaction.

    /// First sync of a path (or re-creation over a tombstone): upsert the
    /// file row, insert version #N as current, log one event.
    pub fn apply_create(
        &self,
        file: &FileRecord,
        version: &FileVersionRecord,
        event: &SyncEventRecord,
        storage_delta: i64,
    ) -> ApiResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        upsert_file(&tx, file)?;
        insert_version(&tx, version)?;
        insert_event(&tx, event)?;
        adjust_used_storage(&tx, &file.user_id, storage_delta)?;

        tx.commit()?;
        Ok(())
    }

    /// Accepted update: demote every prior version, insert the new current
    /// one, refresh file metadata, log one event.
    pub fn apply_accept(
        &self,
        file: &FileRecord,
        version: &FileVersionRecord,
        event: &SyncEventRecord,
        storage_delta: i64,
    ) -> ApiResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE file_versions SET is_current = 0 WHERE file_id = ?",
            params![file.id],
        )?;
        insert_version(&tx, version)?;
        upsert_file(&tx, file)?;
        insert_event(&tx, event)?;
        adjust_used_storage(&tx, &file.user_id, storage_delta)?;

        tx.commit()?;
        Ok(())
    }

    /// Concurrent edit: store the submission as a non-current conflict
    /// version, advance the file's merged vector, log both events.
    pub fn apply_conflict(
        &self,
        file: &FileRecord,
        conflict_version: &FileVersionRecord,
        events: &[SyncEventRecord],
        storage_delta: i64,
    ) -> ApiResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        insert_version(&tx, conflict_version)?;
        upsert_file(&tx, file)?;
        for event in events {
            insert_event(&tx, event)?;
        }
        adjust_used_storage(&tx, &file.user_id, storage_delta)?;

        tx.commit()?;
        Ok(())
    }

    /// File-row update plus its event, with no version write. Covers the
    /// accepted delete (tombstone; the current version row stays recorded)
    /// and the delete-races-edit conflict flag.
    pub fn apply_file_state(&self, file: &FileRecord, event: &SyncEventRecord) -> ApiResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        upsert_file(&tx, file)?;
        insert_event(&tx, event)?;

        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // REFRESH TOKENS
    // ========================================================================

    pub fn insert_refresh_token(
        &self,
        token: &str,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> ApiResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO refresh_tokens (token, user_id, expires_at) VALUES (?, ?, ?)",
            params![token, user_id, expires_at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Consume a refresh token. Returns its owner when valid and unexpired.
    pub fn take_refresh_token(&self, token: &str) -> ApiResult<Option<String>> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = optional(conn.query_row(
            "SELECT user_id, expires_at FROM refresh_tokens WHERE token = ?",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };
        conn.execute("DELETE FROM refresh_tokens WHERE token = ?", params![token])?;

        if expires_at < Utc::now().timestamp_millis() {
            return Ok(None);
        }
        Ok(Some(user_id))
    }

    pub fn delete_refresh_tokens_for(&self, user_id: &str) -> ApiResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM refresh_tokens WHERE user_id = ?",
            params![user_id],
        )?;
        Ok(())
    }
}

// ── SQL fragments & row mapping ──────────────────────────────────────────────

const SELECT_FILE: &str = "SELECT id, user_id, file_path, file_name, file_size, checksum, version_vector, sync_status, conflict_status, created_at, modified_at FROM files";

const SELECT_VERSION: &str = "SELECT id, file_id, version_number, checksum, storage_path, file_size, version_vector, created_by_client, is_current, created_at FROM file_versions";

const SELECT_EVENT: &str = "SELECT id, user_id, file_id, event_type, timestamp, client_id, sync_status, file_path, checksum, file_size, version_vector FROM sync_events";

/// Raw row shapes: strings and integers straight from SQLite, converted to
/// typed records outside the rusqlite closure so JSON errors surface as
/// database-corruption errors rather than panics.
struct RawFile {
    id: String,
    user_id: String,
    file_path: String,
    file_name: String,
    file_size: i64,
    checksum: String,
    version_vector: String,
    sync_status: String,
    conflict_status: String,
    created_at: i64,
    modified_at: i64,
}

struct RawVersion {
    id: String,
    file_id: String,
    version_number: i64,
    checksum: String,
    storage_path: String,
    file_size: i64,
    version_vector: String,
    created_by_client: String,
    is_current: bool,
    created_at: i64,
}

struct RawEvent {
    id: String,
    user_id: String,
    file_id: Option<String>,
    event_type: String,
    timestamp: i64,
    client_id: String,
    sync_status: String,
    file_path: Option<String>,
    checksum: Option<String>,
    file_size: Option<i64>,
    version_vector: Option<String>,
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        storage_quota: row.get::<_, i64>(4)? as u64,
        used_storage: row.get::<_, i64>(5)?.max(0) as u64,
        account_status: row.get(6)?,
        created_at: from_millis(row.get(7)?),
    })
}

fn row_to_raw_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFile> {
    Ok(RawFile {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_path: row.get(2)?,
        file_name: row.get(3)?,
        file_size: row.get(4)?,
        checksum: row.get(5)?,
        version_vector: row.get(6)?,
        sync_status: row.get(7)?,
        conflict_status: row.get(8)?,
        created_at: row.get(9)?,
        modified_at: row.get(10)?,
    })
}

fn row_to_raw_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVersion> {
    Ok(RawVersion {
        id: row.get(0)?,
        file_id: row.get(1)?,
        version_number: row.get(2)?,
        checksum: row.get(3)?,
        storage_path: row.get(4)?,
        file_size: row.get(5)?,
        version_vector: row.get(6)?,
        created_by_client: row.get(7)?,
        is_current: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
    })
}

fn row_to_raw_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        file_id: row.get(2)?,
        event_type: row.get(3)?,
        timestamp: row.get(4)?,
        client_id: row.get(5)?,
        sync_status: row.get(6)?,
        file_path: row.get(7)?,
        checksum: row.get(8)?,
        file_size: row.get(9)?,
        version_vector: row.get(10)?,
    })
}

impl TryFrom<RawFile> for FileRecord {
    type Error = ApiError;

    fn try_from(raw: RawFile) -> ApiResult<Self> {
        Ok(FileRecord {
            id: raw.id,
            user_id: raw.user_id,
            file_path: raw.file_path,
            file_name: raw.file_name,
            file_size: raw.file_size.max(0) as u64,
            checksum: raw.checksum,
            version_vector: parse_vector(&raw.version_vector)?,
            sync_status: enum_from_str(&raw.sync_status)?,
            conflict_status: enum_from_str(&raw.conflict_status)?,
            created_at: from_millis(raw.created_at),
            modified_at: from_millis(raw.modified_at),
        })
    }
}

impl TryFrom<RawVersion> for FileVersionRecord {
    type Error = ApiError;

    fn try_from(raw: RawVersion) -> ApiResult<Self> {
        Ok(FileVersionRecord {
            id: raw.id,
            file_id: raw.file_id,
            version_number: raw.version_number,
            checksum: raw.checksum,
            storage_path: raw.storage_path,
            file_size: raw.file_size.max(0) as u64,
            version_vector: parse_vector(&raw.version_vector)?,
            created_by_client: raw.created_by_client,
            is_current: raw.is_current,
            created_at: from_millis(raw.created_at),
        })
    }
}

impl TryFrom<RawEvent> for SyncEventRecord {
    type Error = ApiError;

    fn try_from(raw: RawEvent) -> ApiResult<Self> {
        Ok(SyncEventRecord {
            id: raw.id,
            user_id: raw.user_id,
            file_id: raw.file_id,
            event_type: enum_from_str(&raw.event_type)?,
            timestamp: from_millis(raw.timestamp),
            client_id: raw.client_id,
            sync_status: enum_from_str(&raw.sync_status)?,
            file_path: raw.file_path,
            checksum: raw.checksum,
            file_size: raw.file_size.map(|s| s.max(0) as u64),
            version_vector: raw
                .version_vector
                .as_deref()
                .map(parse_vector)
                .transpose()?,
        })
    }
}

// ── Write helpers (run inside transactions) ──────────────────────────────────

fn upsert_file(conn: &Connection, file: &FileRecord) -> ApiResult<()> {
    conn.execute(
        "INSERT INTO files (id, user_id, file_path, file_name, file_size, checksum, version_vector, sync_status, conflict_status, created_at, modified_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(user_id, file_path) DO UPDATE SET
             file_size = excluded.file_size,
             checksum = excluded.checksum,
             version_vector = excluded.version_vector,
             sync_status = excluded.sync_status,
             conflict_status = excluded.conflict_status,
             modified_at = excluded.modified_at",
        params![
            file.id,
            file.user_id,
            file.file_path,
            file.file_name,
            file.file_size as i64,
            file.checksum,
            serde_json::to_string(&file.version_vector).map_err(ApiError::from)?,
            enum_to_str(&file.sync_status),
            enum_to_str(&file.conflict_status),
            file.created_at.timestamp_millis(),
            file.modified_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn insert_version(conn: &Connection, version: &FileVersionRecord) -> ApiResult<()> {
    conn.execute(
        "INSERT INTO file_versions (id, file_id, version_number, checksum, storage_path, file_size, version_vector, created_by_client, is_current, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            version.id,
            version.file_id,
            version.version_number,
            version.checksum,
            version.storage_path,
            version.file_size as i64,
            serde_json::to_string(&version.version_vector).map_err(ApiError::from)?,
            version.created_by_client,
            version.is_current as i64,
            version.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn insert_event(conn: &Connection, event: &SyncEventRecord) -> ApiResult<()> {
    conn.execute(
        "INSERT INTO sync_events (id, user_id, file_id, event_type, timestamp, client_id, sync_status, file_path, checksum, file_size, version_vector)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            event.id,
            event.user_id,
            event.file_id,
            enum_to_str(&event.event_type),
            event.timestamp.timestamp_millis(),
            event.client_id,
            enum_to_str(&event.sync_status),
            event.file_path,
            event.checksum,
            event.file_size.map(|s| s as i64),
            event
                .version_vector
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(ApiError::from)?,
        ],
    )?;
    Ok(())
}

fn adjust_used_storage(conn: &Connection, user_id: &str, delta: i64) -> ApiResult<()> {
    if delta == 0 {
        return Ok(());
    }
    conn.execute(
        "UPDATE users SET used_storage = MAX(0, used_storage + ?) WHERE id = ?",
        params![delta, user_id],
    )?;
    Ok(())
}

// ── Conversion helpers ───────────────────────────────────────────────────────

fn optional<T>(result: rusqlite::Result<T>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

fn parse_vector(json: &str) -> ApiResult<VersionVector> {
    serde_json::from_str(json)
        .map_err(|e| ApiError::Database(format!("corrupt version vector: {}", e)))
}

/// Store a wire enum by its serialized name (e.g. `SYNCED`).
fn enum_to_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> ApiResult<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|e| ApiError::Database(format!("corrupt enum value '{}': {}", s, e)))
}
