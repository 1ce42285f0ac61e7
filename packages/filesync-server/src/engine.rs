//! Sync decision engine.
//!
//! Every submission runs under a per-file lock keyed by `(user_id,
//! file_path)` so concurrent clients serialize: the second submission sees
//! whatever vector the first one left behind and is classified against it;
//! no write is ever lost. Lock acquisition is bounded; a timeout surfaces as
//! a busy error rather than queueing forever.
//!
//! Decision tree for a submission with client vector `cv` against the
//! file's current vector `sv`:
//!
//! ```text
//!   file absent or tombstoned ──▶ CREATE: fresh vector {client: 1}
//!   cv concurrent with sv ──────▶ CONFLICT: store non-current version,
//!                                 vector := merge(sv, cv) + server bump
//!   cv == sv ───────────────────▶ SUCCESS, no writes
//!   cv dominates sv ────────────▶ ACCEPT: new current version, vector := cv
//!   sv dominates cv ────────────▶ CLIENT_SHOULD_UPDATE, no writes
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use filesync_core::protocol::{ConflictStatus, EventStatus, SyncEventType, SyncStatus};
use filesync_core::version_vector::SERVER_CLIENT_ID;
use filesync_core::VersionVector;

use crate::bus::EventBus;
use crate::dto::event_to_dto;
use crate::error::{ApiError, ApiResult};
use crate::repository::{
    FileRecord, FileVersionRecord, Repository, SyncEventRecord, UserRecord,
};
use crate::storage::BlobStore;

/// Bounded wait for the per-file lock.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// One file submission, small-file or assembled from chunks.
#[derive(Debug)]
pub struct SyncSubmission {
    pub user_id: String,
    pub file_path: String,
    pub client_id: String,
    pub client_vector: VersionVector,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

/// Classified result of a submission.
#[derive(Debug)]
pub enum SyncOutcome {
    Success(FileRecord),
    Conflict { conflict_version_id: String },
    ClientShouldUpdate,
}

/// The engine. Cheap to clone; lock table and collaborators are shared.
#[derive(Clone)]
pub struct SyncEngine {
    repo: Repository,
    blobs: BlobStore,
    bus: EventBus,
    locks: Arc<DashMap<(String, String), Arc<Mutex<()>>>>,
    lock_timeout: Duration,
}

impl SyncEngine {
    pub fn new(repo: Repository, blobs: BlobStore, bus: EventBus) -> Self {
        Self {
            repo,
            blobs,
            bus,
            locks: Arc::new(DashMap::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    async fn lock_file(
        &self,
        user_id: &str,
        file_path: &str,
    ) -> ApiResult<tokio::sync::OwnedMutexGuard<()>> {
        let key = (user_id.to_string(), file_path.to_string());
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| ApiError::Busy(file_path.to_string()))
    }

    fn resolve_user(&self, user_id: &str) -> ApiResult<UserRecord> {
        self.repo
            .find_user_by_id(user_id)?
            .ok_or_else(|| ApiError::NotFound(format!("user {} does not exist", user_id)))
    }

    fn check_quota(&self, user: &UserRecord, incoming: u64) -> ApiResult<()> {
        if user.used_storage + incoming > user.storage_quota {
            return Err(ApiError::QuotaExceeded(format!(
                "storing {} bytes would exceed the {} byte quota",
                incoming, user.storage_quota
            )));
        }
        Ok(())
    }

    // ── File submission ───────────────────────────────────────────────────

    /// Classify and persist one submission. Runs the whole decision +
    /// persistence under the per-file lock.
    pub async fn sync_file(&self, submission: SyncSubmission) -> ApiResult<SyncOutcome> {
        let _guard = self
            .lock_file(&submission.user_id, &submission.file_path)
            .await?;

        let user = self.resolve_user(&submission.user_id)?;
        let existing = self
            .repo
            .find_file_by_path(&submission.user_id, &submission.file_path)?;

        match existing {
            None => self.create_file(&user, &submission, None),
            Some(file) if file.sync_status == SyncStatus::Deleted => {
                // Tombstoned: a new byte-sequence at the path revives it.
                self.create_file(&user, &submission, Some(file))
            }
            Some(file) => self.update_file(&user, &submission, file),
        }
    }

    /// Path A: first sync of this path, or re-creation over a tombstone.
    fn create_file(
        &self,
        user: &UserRecord,
        submission: &SyncSubmission,
        tombstone: Option<FileRecord>,
    ) -> ApiResult<SyncOutcome> {
        self.check_quota(user, submission.bytes.len() as u64)?;

        let now = Utc::now();
        // Reusing the tombstone's id keeps its version history reachable.
        let file_id = tombstone
            .as_ref()
            .map(|t| t.id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let vector = VersionVector::initial(&submission.client_id);
        let storage_path = BlobStore::version_path(&user.id, &file_id, now);
        self.blobs.write(&storage_path, &submission.bytes)?;

        let file = FileRecord {
            id: file_id.clone(),
            user_id: user.id.clone(),
            file_path: submission.file_path.clone(),
            file_name: file_name_of(&submission.file_path),
            file_size: submission.bytes.len() as u64,
            checksum: submission.checksum.clone(),
            version_vector: vector.clone(),
            sync_status: SyncStatus::Synced,
            conflict_status: ConflictStatus::None,
            created_at: tombstone.map(|t| t.created_at).unwrap_or(now),
            modified_at: now,
        };

        let version = FileVersionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file_id.clone(),
            version_number: self.repo.max_version_number(&file_id)? + 1,
            checksum: submission.checksum.clone(),
            storage_path: storage_path.clone(),
            file_size: file.file_size,
            version_vector: vector,
            created_by_client: submission.client_id.clone(),
            is_current: true,
            created_at: now,
        };

        let event = self.event_for(&file, submission, SyncEventType::Create);

        if let Err(e) = self
            .repo
            .apply_create(&file, &version, &event, file.file_size as i64)
        {
            self.blobs.remove(&storage_path);
            return Err(e);
        }

        self.bus.publish_file_change(&user.id, &event_to_dto(&event));
        tracing::info!(
            user = user.username.as_str(),
            path = file.file_path.as_str(),
            "File created"
        );
        Ok(SyncOutcome::Success(file))
    }

    /// Path B: the path exists; classify against the server's vector.
    fn update_file(
        &self,
        user: &UserRecord,
        submission: &SyncSubmission,
        file: FileRecord,
    ) -> ApiResult<SyncOutcome> {
        let server_vector = file.version_vector.clone();
        let client_vector = &submission.client_vector;

        if client_vector.concurrent_with(&server_vector) {
            return self.record_conflict(user, submission, file);
        }

        if *client_vector == server_vector {
            // Idempotent resubmission of the state we already hold.
            tracing::debug!(path = file.file_path.as_str(), "Vectors equal, no-op");
            return Ok(SyncOutcome::Success(file));
        }

        if client_vector.dominates(&server_vector) {
            return self.accept_update(user, submission, file);
        }

        tracing::debug!(
            path = file.file_path.as_str(),
            "Server vector dominates, client must update"
        );
        Ok(SyncOutcome::ClientShouldUpdate)
    }

    /// Client built on everything we have: take its content as current.
    fn accept_update(
        &self,
        user: &UserRecord,
        submission: &SyncSubmission,
        mut file: FileRecord,
    ) -> ApiResult<SyncOutcome> {
        self.check_quota(user, submission.bytes.len() as u64)?;

        let now = Utc::now();
        let storage_path = BlobStore::version_path(&user.id, &file.id, now);
        self.blobs.write(&storage_path, &submission.bytes)?;

        file.file_size = submission.bytes.len() as u64;
        file.checksum = submission.checksum.clone();
        file.version_vector = submission.client_vector.clone();
        file.sync_status = SyncStatus::Synced;
        file.conflict_status = ConflictStatus::None;
        file.modified_at = now;

        let version = FileVersionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file.id.clone(),
            version_number: self.repo.max_version_number(&file.id)? + 1,
            checksum: file.checksum.clone(),
            storage_path: storage_path.clone(),
            file_size: file.file_size,
            version_vector: file.version_vector.clone(),
            created_by_client: submission.client_id.clone(),
            is_current: true,
            created_at: now,
        };

        let event = self.event_for(&file, submission, SyncEventType::Modify);

        if let Err(e) = self
            .repo
            .apply_accept(&file, &version, &event, file.file_size as i64)
        {
            self.blobs.remove(&storage_path);
            return Err(e);
        }

        self.bus.publish_file_change(&user.id, &event_to_dto(&event));
        tracing::info!(
            user = user.username.as_str(),
            path = file.file_path.as_str(),
            version = version.version_number,
            "Update accepted"
        );
        Ok(SyncOutcome::Success(file))
    }

    /// Concurrent edit: keep the server's content current, store the
    /// submission as an addressable conflict version, and advance the file
    /// vector to a strict successor of both sides.
    fn record_conflict(
        &self,
        user: &UserRecord,
        submission: &SyncSubmission,
        mut file: FileRecord,
    ) -> ApiResult<SyncOutcome> {
        self.check_quota(user, submission.bytes.len() as u64)?;

        let now = Utc::now();
        let storage_path =
            BlobStore::conflict_path(&user.id, &file.id, &submission.client_id, now);
        self.blobs.write(&storage_path, &submission.bytes)?;

        let conflict_version = FileVersionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            file_id: file.id.clone(),
            version_number: self.repo.max_version_number(&file.id)? + 1,
            checksum: submission.checksum.clone(),
            storage_path: storage_path.clone(),
            file_size: submission.bytes.len() as u64,
            version_vector: submission.client_vector.clone(),
            created_by_client: submission.client_id.clone(),
            is_current: false,
            created_at: now,
        };

        let mut merged = file.version_vector.merge(&submission.client_vector);
        merged.increment(SERVER_CLIENT_ID);
        file.version_vector = merged;
        file.conflict_status = ConflictStatus::Conflict;
        file.modified_at = now;

        let modify_event = self.event_for(&file, submission, SyncEventType::Modify);
        let mut conflict_event = self.event_for(&file, submission, SyncEventType::Conflict);
        conflict_event.version_vector = Some(file.version_vector.clone());

        let events = vec![modify_event, conflict_event.clone()];
        if let Err(e) = self.repo.apply_conflict(
            &file,
            &conflict_version,
            &events,
            conflict_version.file_size as i64,
        ) {
            self.blobs.remove(&storage_path);
            return Err(e);
        }

        self.bus.publish_conflict(&user.id, &event_to_dto(&conflict_event));
        tracing::warn!(
            user = user.username.as_str(),
            path = file.file_path.as_str(),
            client = submission.client_id.as_str(),
            "Concurrent edit stored as conflict version"
        );
        Ok(SyncOutcome::Conflict {
            conflict_version_id: conflict_version.id,
        })
    }

    // ── Deletion ──────────────────────────────────────────────────────────

    /// Classify a deletion request. On accept the file is tombstoned; its
    /// current version row stays recorded.
    pub async fn delete_file(
        &self,
        user_id: &str,
        file_id: &str,
        client_id: &str,
        client_vector: &VersionVector,
    ) -> ApiResult<SyncOutcome> {
        let file = self
            .repo
            .find_file_by_id(file_id)?
            .ok_or_else(|| ApiError::NotFound(format!("file {} does not exist", file_id)))?;
        if file.user_id != user_id {
            return Err(ApiError::Forbidden("file belongs to another user".into()));
        }

        let _guard = self.lock_file(user_id, &file.file_path).await?;
        let user = self.resolve_user(user_id)?;

        // Re-read under the lock; a concurrent submission may have moved it.
        let mut file = self
            .repo
            .find_file_by_id(file_id)?
            .ok_or_else(|| ApiError::NotFound(format!("file {} does not exist", file_id)))?;
        let server_vector = file.version_vector.clone();

        if client_vector.concurrent_with(&server_vector) {
            // Delete raced an edit: nothing is tombstoned, the surviving
            // current version is what the conflict points at.
            let mut merged = server_vector.merge(client_vector);
            merged.increment(SERVER_CLIENT_ID);
            file.version_vector = merged;
            file.conflict_status = ConflictStatus::Conflict;
            file.modified_at = Utc::now();

            let event = SyncEventRecord {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                file_id: Some(file.id.clone()),
                event_type: SyncEventType::Conflict,
                timestamp: Utc::now(),
                client_id: client_id.to_string(),
                sync_status: EventStatus::Completed,
                file_path: Some(file.file_path.clone()),
                checksum: Some(file.checksum.clone()),
                file_size: Some(file.file_size),
                version_vector: Some(file.version_vector.clone()),
            };
            self.repo.apply_file_state(&file, &event)?;
            self.bus.publish_conflict(&user.id, &event_to_dto(&event));

            let surviving = self
                .repo
                .current_version(&file.id)?
                .map(|v| v.id)
                .ok_or_else(|| {
                    ApiError::Database(format!("file {} has no current version", file.id))
                })?;
            tracing::warn!(
                user = user.username.as_str(),
                path = file.file_path.as_str(),
                "Delete raced a concurrent edit"
            );
            return Ok(SyncOutcome::Conflict {
                conflict_version_id: surviving,
            });
        }

        if server_vector.dominates(client_vector) && server_vector != *client_vector {
            return Ok(SyncOutcome::ClientShouldUpdate);
        }

        // Accept: tombstone
        file.sync_status = SyncStatus::Deleted;
        file.version_vector = client_vector.clone();
        file.modified_at = Utc::now();

        let event = SyncEventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            file_id: Some(file.id.clone()),
            event_type: SyncEventType::Delete,
            timestamp: Utc::now(),
            client_id: client_id.to_string(),
            sync_status: EventStatus::Completed,
            file_path: Some(file.file_path.clone()),
            checksum: Some(file.checksum.clone()),
            file_size: Some(file.file_size),
            version_vector: Some(file.version_vector.clone()),
        };
        self.repo.apply_file_state(&file, &event)?;

        self.bus.publish_file_change(&user.id, &event_to_dto(&event));
        tracing::info!(
            user = user.username.as_str(),
            path = file.file_path.as_str(),
            "File tombstoned"
        );
        Ok(SyncOutcome::Success(file))
    }

    fn event_for(
        &self,
        file: &FileRecord,
        submission: &SyncSubmission,
        event_type: SyncEventType,
    ) -> SyncEventRecord {
        SyncEventRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: file.user_id.clone(),
            file_id: Some(file.id.clone()),
            event_type,
            timestamp: Utc::now(),
            client_id: submission.client_id.clone(),
            sync_status: EventStatus::Completed,
            file_path: Some(file.file_path.clone()),
            checksum: Some(file.checksum.clone()),
            file_size: Some(file.file_size),
            version_vector: Some(file.version_vector.clone()),
        }
    }
}

fn file_name_of(file_path: &str) -> String {
    file_path.rsplit('/').next().unwrap_or(file_path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::chunking::sha256_hex;
    use filesync_core::protocol::{ServerFrame, CONFLICTS_DESTINATION, FILE_CHANGES_DESTINATION};

    struct Harness {
        engine: SyncEngine,
        repo: Repository,
        bus: EventBus,
        user: UserRecord,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(None).unwrap();
        let blobs = BlobStore::new(dir.path());
        let bus = EventBus::new();
        let engine = SyncEngine::new(repo.clone(), blobs, bus.clone());
        let user = repo
            .create_user("alice", "alice@example.com", "hash", 1 << 30)
            .unwrap();
        Harness {
            engine,
            repo,
            bus,
            user,
            _dir: dir,
        }
    }

    fn submission(h: &Harness, path: &str, content: &[u8], vector: VersionVector) -> SyncSubmission {
        SyncSubmission {
            user_id: h.user.id.clone(),
            file_path: path.to_string(),
            client_id: "client-a".to_string(),
            client_vector: vector,
            checksum: sha256_hex(content),
            bytes: content.to_vec(),
        }
    }

    fn vector_of(entries: &[(&str, u64)]) -> VersionVector {
        let mut v = VersionVector::new();
        for (client, count) in entries {
            for _ in 0..*count {
                v.increment(client);
            }
        }
        v
    }

    #[tokio::test]
    async fn test_happy_create() {
        let h = harness();
        let outcome = h
            .engine
            .sync_file(submission(
                &h,
                "docs/readme.md",
                b"hello world13",
                vector_of(&[("client-a", 1)]),
            ))
            .await
            .unwrap();

        let SyncOutcome::Success(file) = outcome else {
            panic!("expected success");
        };
        assert_eq!(file.file_name, "readme.md");
        assert_eq!(file.version_vector, vector_of(&[("client-a", 1)]));
        assert_eq!(file.sync_status, SyncStatus::Synced);

        let version = h.repo.current_version(&file.id).unwrap().unwrap();
        assert_eq!(version.version_number, 1);

        // Storage accounted
        let user = h.repo.find_user_by_id(&h.user.id).unwrap().unwrap();
        assert_eq!(user.used_storage, 13);
    }

    #[tokio::test]
    async fn test_sequential_edit_accepted() {
        let h = harness();
        h.engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();

        let outcome = h
            .engine
            .sync_file(submission(
                &h,
                "a.txt",
                b"version two",
                vector_of(&[("client-a", 2)]),
            ))
            .await
            .unwrap();

        let SyncOutcome::Success(file) = outcome else {
            panic!("expected success");
        };
        assert_eq!(file.version_vector, vector_of(&[("client-a", 2)]));
        assert_eq!(file.checksum, sha256_hex(b"version two"));

        let versions = h.repo.list_versions(&file.id).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.iter().filter(|v| v.is_current).count() == 1);
    }

    #[tokio::test]
    async fn test_concurrent_edit_becomes_conflict() {
        let h = harness();
        // A creates, server at {A:1}
        h.engine
            .sync_file(submission(&h, "a.txt", b"base", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        // A edits to {A:2} (content X)
        h.engine
            .sync_file(submission(
                &h,
                "a.txt",
                b"content X",
                vector_of(&[("client-a", 2)]),
            ))
            .await
            .unwrap();

        // B, who only saw {A:1}, submits {A:1, B:1} (content Y)
        let mut sub = submission(
            &h,
            "a.txt",
            b"content Y",
            vector_of(&[("client-a", 1), ("client-b", 1)]),
        );
        sub.client_id = "client-b".to_string();
        let outcome = h.engine.sync_file(sub).await.unwrap();

        let SyncOutcome::Conflict {
            conflict_version_id,
        } = outcome
        else {
            panic!("expected conflict");
        };

        // The conflict version is stored, addressable, non-current
        let stored = h.repo.find_version(&conflict_version_id).unwrap().unwrap();
        assert!(!stored.is_current);
        assert_eq!(stored.checksum, sha256_hex(b"content Y"));
        assert_eq!(stored.created_by_client, "client-b");

        // Server content X remains current
        let file = h
            .repo
            .find_file_by_path(&h.user.id, "a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(file.checksum, sha256_hex(b"content X"));
        assert_eq!(file.conflict_status, ConflictStatus::Conflict);

        // Merged vector strictly dominates both sides: {A:2, B:1, server:1}
        assert_eq!(file.version_vector.get("client-a"), 2);
        assert_eq!(file.version_vector.get("client-b"), 1);
        assert_eq!(file.version_vector.get(SERVER_CLIENT_ID), 1);
    }

    #[tokio::test]
    async fn test_stale_client_told_to_update() {
        let h = harness();
        h.engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        h.engine
            .sync_file(submission(&h, "a.txt", b"v2", vector_of(&[("client-a", 2)])))
            .await
            .unwrap();

        // Replay of the older state
        let outcome = h
            .engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::ClientShouldUpdate));
    }

    #[tokio::test]
    async fn test_equal_vectors_are_a_no_op() {
        let h = harness();
        h.engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();

        let outcome = h
            .engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        let SyncOutcome::Success(file) = outcome else {
            panic!("expected success");
        };

        // No second version was written
        assert_eq!(h.repo.list_versions(&file.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_recreate_clears_tombstone() {
        let h = harness();
        let SyncOutcome::Success(file) = h
            .engine
            .sync_file(submission(&h, "photo.png", b"old", vector_of(&[("client-a", 1)])))
            .await
            .unwrap()
        else {
            panic!("expected success");
        };

        // Delete with a successor vector
        let outcome = h
            .engine
            .delete_file(&h.user.id, &file.id, "client-a", &vector_of(&[("client-a", 2)]))
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Success(_)));
        assert!(h.repo.list_files(&h.user.id).unwrap().is_empty());

        // New bytes at the same path revive it with a fresh vector
        let outcome = h
            .engine
            .sync_file(submission(
                &h,
                "photo.png",
                b"brand new bytes",
                vector_of(&[("client-a", 1)]),
            ))
            .await
            .unwrap();
        let SyncOutcome::Success(revived) = outcome else {
            panic!("expected success");
        };
        assert_eq!(revived.sync_status, SyncStatus::Synced);
        assert_eq!(revived.id, file.id); // history chain preserved
        assert_eq!(revived.version_vector, vector_of(&[("client-a", 1)]));
        assert_eq!(h.repo.list_files(&h.user.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_delete_is_a_conflict() {
        let h = harness();
        let SyncOutcome::Success(file) = h
            .engine
            .sync_file(submission(&h, "a.txt", b"base", vector_of(&[("client-a", 1)])))
            .await
            .unwrap()
        else {
            panic!("expected success");
        };
        // A edits to {A:2}
        h.engine
            .sync_file(submission(&h, "a.txt", b"edited", vector_of(&[("client-a", 2)])))
            .await
            .unwrap();

        // B deletes based on {A:1, B:1}, concurrent with {A:2}
        let outcome = h
            .engine
            .delete_file(
                &h.user.id,
                &file.id,
                "client-b",
                &vector_of(&[("client-a", 1), ("client-b", 1)]),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SyncOutcome::Conflict { .. }));

        // Nothing was tombstoned
        let current = h
            .repo
            .find_file_by_path(&h.user.id, "a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(current.sync_status, SyncStatus::Synced);
        assert_eq!(current.conflict_status, ConflictStatus::Conflict);
    }

    #[tokio::test]
    async fn test_events_published_to_peers_not_producer() {
        let h = harness();
        let (handle_a, mut rx_a) = h.bus.subscribe(&h.user.id, "client-a");
        h.bus.add_destination(&handle_a, FILE_CHANGES_DESTINATION);
        let (handle_b, mut rx_b) = h.bus.subscribe(&h.user.id, "client-b");
        h.bus.add_destination(&handle_b, FILE_CHANGES_DESTINATION);

        h.engine
            .sync_file(submission(&h, "a.txt", b"v1", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();

        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            ServerFrame::Event { event, .. } => {
                assert_eq!(event.event_type, SyncEventType::Create);
                assert_eq!(event.file_path.as_deref(), Some("a.txt"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conflict_notifies_all_subscribers() {
        let h = harness();
        h.engine
            .sync_file(submission(&h, "a.txt", b"base", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        h.engine
            .sync_file(submission(&h, "a.txt", b"X", vector_of(&[("client-a", 2)])))
            .await
            .unwrap();

        let (ha, mut rx_a) = h.bus.subscribe(&h.user.id, "client-a");
        h.bus.add_destination(&ha, CONFLICTS_DESTINATION);
        let (hb, mut rx_b) = h.bus.subscribe(&h.user.id, "client-b");
        h.bus.add_destination(&hb, CONFLICTS_DESTINATION);

        let mut sub = submission(
            &h,
            "a.txt",
            b"Y",
            vector_of(&[("client-a", 1), ("client-b", 1)]),
        );
        sub.client_id = "client-b".to_string();
        h.engine.sync_file(sub).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv().unwrap() {
                ServerFrame::Event { destination, event } => {
                    assert_eq!(destination, CONFLICTS_DESTINATION);
                    assert_eq!(event.event_type, SyncEventType::Conflict);
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open(None).unwrap();
        let blobs = BlobStore::new(dir.path());
        let bus = EventBus::new();
        let engine = SyncEngine::new(repo.clone(), blobs, bus);
        let user = repo.create_user("tiny", "t@example.com", "hash", 10).unwrap();

        let content = b"way more than ten bytes of content";
        let err = engine
            .sync_file(SyncSubmission {
                user_id: user.id.clone(),
                file_path: "big.bin".to_string(),
                client_id: "client-a".to_string(),
                client_vector: vector_of(&[("client-a", 1)]),
                checksum: sha256_hex(content),
                bytes: content.to_vec(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_serialized_conflicting_submissions_resolve_to_dominant_vector() {
        // Two concurrent-with-server submissions on one file: the per-file
        // lock serializes them, the second classifies against the first's
        // merged vector, and the final vector dominates every submission.
        let h = harness();
        h.engine
            .sync_file(submission(&h, "a.txt", b"base", vector_of(&[("client-a", 1)])))
            .await
            .unwrap();
        h.engine
            .sync_file(submission(&h, "a.txt", b"X", vector_of(&[("client-a", 2)])))
            .await
            .unwrap();

        let vector_b = vector_of(&[("client-a", 1), ("client-b", 1)]);
        let vector_c = vector_of(&[("client-a", 1), ("client-c", 1)]);

        let mut sub_b = submission(&h, "a.txt", b"Y", vector_b.clone());
        sub_b.client_id = "client-b".to_string();
        let mut sub_c = submission(&h, "a.txt", b"Z", vector_c.clone());
        sub_c.client_id = "client-c".to_string();

        let (r1, r2) = tokio::join!(h.engine.sync_file(sub_b), h.engine.sync_file(sub_c));
        assert!(matches!(r1.unwrap(), SyncOutcome::Conflict { .. }));
        assert!(matches!(r2.unwrap(), SyncOutcome::Conflict { .. }));

        let file = h
            .repo
            .find_file_by_path(&h.user.id, "a.txt")
            .unwrap()
            .unwrap();
        assert!(file.version_vector.dominates(&vector_b));
        assert!(file.version_vector.dominates(&vector_c));
        assert!(file.version_vector.dominates(&vector_of(&[("client-a", 2)])));
        // Two server bumps, one per conflict resolution
        assert_eq!(file.version_vector.get(SERVER_CLIENT_ID), 2);
    }
}
