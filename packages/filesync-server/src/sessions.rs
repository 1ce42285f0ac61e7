//! Chunk upload sessions.
//!
//! A session is the envelope for one large-file upload: a bitset of
//! received chunk indices, a staging directory holding the chunk bytes, and
//! a TTL. Chunk receipt is idempotent: re-sending an already-received
//! index is a no-op success, which is what makes client retry loops safe.
//! When the last bit sets, the session assembles, verifies, and hands the
//! bytes to the decision engine.
//!
//! Sessions are scratch state: kept in memory, staged on disk, swept by a
//! background task. They do not survive a server restart.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use filesync_core::chunking::sha256_hex;
use filesync_core::protocol::{InitiateUploadRequest, SessionStatus, UploadSessionDto};
use filesync_core::VersionVector;

use crate::error::{ApiError, ApiResult};
use crate::storage::BlobStore;

/// Session lifetime and housekeeping bounds.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an in-progress session may live.
    pub ttl: Duration,
    /// How long finished session records are kept for status queries.
    pub retention: Duration,
    /// Cap on concurrently active sessions per user.
    pub max_active_per_user: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            retention: Duration::from_secs(24 * 3600),
            max_active_per_user: 8,
        }
    }
}

/// One upload session.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: String,
    pub user_id: String,
    pub file_id: String,
    pub file_path: String,
    pub client_id: String,
    pub version_vector: VersionVector,
    /// Whole-file SHA-256 announced at initiation, verified after assembly.
    pub expected_checksum: Option<String>,
    pub total_chunks: u32,
    pub received: Vec<bool>,
    pub received_chunks: u32,
    pub total_file_size: u64,
    pub received_size: u64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl UploadSession {
    pub fn to_dto(&self) -> UploadSessionDto {
        UploadSessionDto {
            session_id: self.session_id.clone(),
            file_id: self.file_id.clone(),
            file_path: self.file_path.clone(),
            total_chunks: self.total_chunks,
            received_chunks: self.received_chunks,
            received_bitset: self.received.clone(),
            total_file_size: self.total_file_size,
            received_size: self.received_size,
            progress: f64::from(self.received_chunks) / f64::from(self.total_chunks),
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            error_message: self.error_message.clone(),
        }
    }
}

/// A fully received upload, ready for the decision engine.
#[derive(Debug)]
pub struct AssembledUpload {
    pub user_id: String,
    pub file_id: String,
    pub file_path: String,
    pub client_id: String,
    pub version_vector: VersionVector,
    pub checksum: String,
    pub bytes: Vec<u8>,
}

/// The session table and its staging store.
#[derive(Clone)]
pub struct SessionManager {
    sessions: std::sync::Arc<DashMap<String, UploadSession>>,
    blobs: BlobStore,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(blobs: BlobStore, config: SessionConfig) -> Self {
        Self {
            sessions: std::sync::Arc::new(DashMap::new()),
            blobs,
            config,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Open a session. An existing in-progress session for the same
    /// `(user, path)` is superseded after its staging is cleaned up.
    pub fn initiate(
        &self,
        user_id: &str,
        request: &InitiateUploadRequest,
    ) -> ApiResult<UploadSessionDto> {
        if request.total_chunks < 1 {
            return Err(ApiError::Validation("total_chunks must be at least 1".into()));
        }
        if request.total_file_size == 0 {
            return Err(ApiError::Validation("total_file_size must be positive".into()));
        }

        // Supersede a stalled session for the same path
        let superseded: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| {
                s.user_id == user_id
                    && s.file_path == request.file_path
                    && s.status == SessionStatus::InProgress
            })
            .map(|s| s.session_id.clone())
            .collect();
        for session_id in superseded {
            tracing::info!(
                session = session_id.as_str(),
                path = request.file_path.as_str(),
                "Superseding stalled upload session"
            );
            self.fail(&session_id, "superseded by a new session");
        }

        let active = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SessionStatus::InProgress)
            .count();
        if active >= self.config.max_active_per_user {
            return Err(ApiError::Validation(format!(
                "too many active upload sessions (limit {})",
                self.config.max_active_per_user
            )));
        }

        let now = Utc::now();
        let session = UploadSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            file_id: request
                .file_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            file_path: request.file_path.clone(),
            client_id: request.client_id.clone(),
            version_vector: request.version_vector.clone(),
            expected_checksum: request.checksum.clone(),
            total_chunks: request.total_chunks,
            received: vec![false; request.total_chunks as usize],
            received_chunks: 0,
            total_file_size: request.total_file_size,
            received_size: 0,
            status: SessionStatus::InProgress,
            created_at: now,
            completed_at: None,
            expires_at: now + chrono::Duration::from_std(self.config.ttl).expect("ttl fits"),
            error_message: None,
        };

        let dto = session.to_dto();
        tracing::info!(
            session = session.session_id.as_str(),
            path = session.file_path.as_str(),
            chunks = session.total_chunks,
            size = session.total_file_size,
            "Upload session opened"
        );
        self.sessions.insert(session.session_id.clone(), session);
        Ok(dto)
    }

    /// Receive one chunk. Returns the updated snapshot, plus the assembled
    /// upload when this chunk completed the session.
    pub fn receive_chunk(
        &self,
        user_id: &str,
        session_id: &str,
        chunk_index: u32,
        bytes: &[u8],
        client_checksum: Option<&str>,
    ) -> ApiResult<(UploadSessionDto, Option<AssembledUpload>)> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ApiError::NotFound(format!("session {} does not exist", session_id)))?;

        if session.user_id != user_id {
            return Err(ApiError::Forbidden("session belongs to another user".into()));
        }

        if session.status == SessionStatus::InProgress && Utc::now() > session.expires_at {
            session.status = SessionStatus::Expired;
            session.error_message = Some("session expired before completion".into());
            self.blobs.remove_staging(session_id);
            return Err(ApiError::SessionExpired(format!(
                "session {} expired",
                session_id
            )));
        }
        match session.status {
            SessionStatus::InProgress => {}
            SessionStatus::Expired => {
                return Err(ApiError::SessionExpired(format!(
                    "session {} expired",
                    session_id
                )))
            }
            other => {
                return Err(ApiError::Validation(format!(
                    "session {} is {:?}, not accepting chunks",
                    session_id, other
                )))
            }
        }

        if chunk_index >= session.total_chunks {
            return Err(ApiError::Validation(format!(
                "chunk index {} out of range (total {})",
                chunk_index, session.total_chunks
            )));
        }

        // Idempotent retry: the bit is already set, report current state.
        if session.received[chunk_index as usize] {
            tracing::debug!(
                session = session_id,
                chunk = chunk_index,
                "Duplicate chunk, no-op"
            );
            return Ok((session.to_dto(), None));
        }

        if let Some(expected) = client_checksum {
            let actual = sha256_hex(bytes);
            if actual != expected {
                session.status = SessionStatus::Failed;
                session.error_message = Some(format!(
                    "chunk {} checksum mismatch",
                    chunk_index
                ));
                self.blobs.remove_staging(session_id);
                return Err(ApiError::Integrity(format!(
                    "chunk {} checksum mismatch: expected {}, got {}",
                    chunk_index, expected, actual
                )));
            }
        }

        self.blobs.stage_chunk(session_id, chunk_index, bytes)?;
        session.received[chunk_index as usize] = true;
        session.received_chunks += 1;
        session.received_size += bytes.len() as u64;

        tracing::debug!(
            session = session_id,
            chunk = chunk_index,
            progress = format!("{}/{}", session.received_chunks, session.total_chunks),
            "Chunk received"
        );

        if session.received_chunks < session.total_chunks {
            return Ok((session.to_dto(), None));
        }

        // All bits set: assemble and verify.
        match self.assemble(&session) {
            Ok(assembled) => {
                session.status = SessionStatus::Completed;
                session.completed_at = Some(Utc::now());
                self.blobs.remove_staging(session_id);
                tracing::info!(
                    session = session_id,
                    path = session.file_path.as_str(),
                    size = assembled.bytes.len(),
                    "Upload session completed"
                );
                Ok((session.to_dto(), Some(assembled)))
            }
            Err(e) => {
                session.status = SessionStatus::Failed;
                session.error_message = Some(e.to_string());
                self.blobs.remove_staging(session_id);
                Err(e)
            }
        }
    }

    fn assemble(&self, session: &UploadSession) -> ApiResult<AssembledUpload> {
        let mut bytes = Vec::with_capacity(session.total_file_size as usize);
        for index in 0..session.total_chunks {
            bytes.extend_from_slice(&self.blobs.read_chunk(&session.session_id, index)?);
        }

        if bytes.len() as u64 != session.total_file_size {
            return Err(ApiError::Integrity(format!(
                "assembled {} bytes, session announced {}",
                bytes.len(),
                session.total_file_size
            )));
        }

        let checksum = sha256_hex(&bytes);
        if let Some(expected) = &session.expected_checksum {
            if checksum != *expected {
                return Err(ApiError::Integrity(format!(
                    "assembled checksum mismatch: expected {}, got {}",
                    expected, checksum
                )));
            }
        }

        Ok(AssembledUpload {
            user_id: session.user_id.clone(),
            file_id: session.file_id.clone(),
            file_path: session.file_path.clone(),
            client_id: session.client_id.clone(),
            version_vector: session.version_vector.clone(),
            checksum,
            bytes,
        })
    }

    /// Session snapshot for status polling.
    pub fn status(&self, user_id: &str, session_id: &str) -> ApiResult<UploadSessionDto> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ApiError::NotFound(format!("session {} does not exist", session_id)))?;
        if session.user_id != user_id {
            return Err(ApiError::Forbidden("session belongs to another user".into()));
        }
        Ok(session.to_dto())
    }

    /// User-requested cancel: IN_PROGRESS → FAILED, staging removed.
    pub fn cancel(&self, user_id: &str, session_id: &str) -> ApiResult<UploadSessionDto> {
        {
            let session = self.sessions.get(session_id).ok_or_else(|| {
                ApiError::NotFound(format!("session {} does not exist", session_id))
            })?;
            if session.user_id != user_id {
                return Err(ApiError::Forbidden("session belongs to another user".into()));
            }
            if session.status != SessionStatus::InProgress {
                return Err(ApiError::Validation(format!(
                    "session {} is not in progress",
                    session_id
                )));
            }
        }
        self.fail(session_id, "cancelled by user");
        self.status(user_id, session_id)
    }

    /// The user's in-progress sessions.
    pub fn active_sessions(&self, user_id: &str) -> Vec<UploadSessionDto> {
        self.sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SessionStatus::InProgress)
            .map(|s| s.to_dto())
            .collect()
    }

    /// Periodic sweep: expire overdue in-progress sessions and drop
    /// finished records past the retention window.
    pub fn sweep(&self) {
        let now = Utc::now();
        let retention =
            chrono::Duration::from_std(self.config.retention).expect("retention fits");

        let mut expired = 0usize;
        for mut session in self.sessions.iter_mut() {
            if session.status == SessionStatus::InProgress && now > session.expires_at {
                session.status = SessionStatus::Expired;
                session.error_message = Some("session expired before completion".into());
                self.blobs.remove_staging(&session.session_id.clone());
                expired += 1;
            }
        }

        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| match s.status {
                SessionStatus::InProgress => false,
                SessionStatus::Completed => s
                    .completed_at
                    .map(|done| now > done + retention)
                    .unwrap_or(false),
                SessionStatus::Failed | SessionStatus::Expired => {
                    now > s.created_at + retention
                }
            })
            .map(|s| s.session_id.clone())
            .collect();
        let dropped = stale.len();
        for session_id in stale {
            self.sessions.remove(&session_id);
        }

        if expired > 0 || dropped > 0 {
            tracing::info!(expired, dropped, "Upload session sweep");
        }
    }

    fn fail(&self, session_id: &str, reason: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.status = SessionStatus::Failed;
            session.error_message = Some(reason.to_string());
        }
        self.blobs.remove_staging(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::chunking::{split, FileChunk};

    fn manager(dir: &tempfile::TempDir) -> SessionManager {
        SessionManager::new(BlobStore::new(dir.path()), SessionConfig::default())
    }

    fn initiate_request(path: &str, chunks: &[FileChunk], total: u64, checksum: &str) -> InitiateUploadRequest {
        InitiateUploadRequest {
            file_id: None,
            file_path: path.to_string(),
            total_chunks: chunks.len() as u32,
            total_file_size: total,
            checksum: Some(checksum.to_string()),
            client_id: "client-a".to_string(),
            version_vector: VersionVector::initial("client-a"),
        }
    }

    /// Small synthetic chunks (the chunker itself is tested in core).
    fn make_chunks(content: &[u8], chunk_size: usize) -> Vec<FileChunk> {
        let total_chunks = content.len().div_ceil(chunk_size) as u32;
        content
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, window)| FileChunk {
                chunk_index: i as u32,
                total_chunks,
                chunk_size: window.len(),
                chunk_data: window.to_vec(),
                chunk_checksum: sha256_hex(window),
                is_last_chunk: i as u32 == total_chunks - 1,
            })
            .collect()
    }

    #[test]
    fn test_initiate_validations() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let mut req = initiate_request("a.bin", &make_chunks(b"abc", 1), 3, &sha256_hex(b"abc"));
        req.total_chunks = 0;
        assert!(matches!(
            mgr.initiate("user-1", &req).unwrap_err(),
            ApiError::Validation(_)
        ));

        let mut req = initiate_request("a.bin", &make_chunks(b"abc", 1), 3, &sha256_hex(b"abc"));
        req.total_file_size = 0;
        assert!(matches!(
            mgr.initiate("user-1", &req).unwrap_err(),
            ApiError::Validation(_)
        ));
    }

    #[test]
    fn test_resume_with_gap_and_redundant_chunk() {
        // Mirrors a client that uploads 0,1,2,4,5, dies, then re-sends 2
        // (redundant) and 3 (the gap).
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let content: Vec<u8> = (0..60u8).collect();
        let chunks = make_chunks(&content, 10);
        let checksum = sha256_hex(&content);
        let session = mgr
            .initiate("user-1", &initiate_request("big.bin", &chunks, 60, &checksum))
            .unwrap();

        for index in [0u32, 1, 2, 4, 5] {
            let chunk = &chunks[index as usize];
            let (dto, done) = mgr
                .receive_chunk(
                    "user-1",
                    &session.session_id,
                    index,
                    &chunk.chunk_data,
                    Some(&chunk.chunk_checksum),
                )
                .unwrap();
            assert!(done.is_none());
            assert_eq!(dto.status, SessionStatus::InProgress);
        }

        let status = mgr.status("user-1", &session.session_id).unwrap();
        assert_eq!(status.received_chunks, 5);
        assert_eq!(
            status.received_bitset,
            vec![true, true, true, false, true, true]
        );
        assert!((status.progress - 5.0 / 6.0).abs() < 1e-9);

        // Redundant resend of chunk 2 is a no-op success
        let (dto, done) = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                2,
                &chunks[2].chunk_data,
                Some(&chunks[2].chunk_checksum),
            )
            .unwrap();
        assert!(done.is_none());
        assert_eq!(dto.received_chunks, 5);
        assert_eq!(dto.received_size, 50);

        // The missing chunk completes the session
        let (dto, done) = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                3,
                &chunks[3].chunk_data,
                Some(&chunks[3].chunk_checksum),
            )
            .unwrap();
        assert_eq!(dto.status, SessionStatus::Completed);
        let assembled = done.unwrap();
        assert_eq!(assembled.bytes, content);
        assert_eq!(assembled.checksum, checksum);
    }

    #[test]
    fn test_chunk_checksum_mismatch_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let content = b"0123456789";
        let chunks = make_chunks(content, 5);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 10, &sha256_hex(content)),
            )
            .unwrap();

        let err = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                0,
                &chunks[0].chunk_data,
                Some("not-the-right-checksum"),
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Integrity(_)));

        let status = mgr.status("user-1", &session.session_id).unwrap();
        assert_eq!(status.status, SessionStatus::Failed);
        assert!(status.error_message.is_some());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let chunks = make_chunks(b"abcde", 5);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();

        let err = mgr
            .receive_chunk("user-1", &session.session_id, 7, b"zzz", None)
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_assembled_size_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let chunks = make_chunks(b"abcde", 5);
        // Announce a size that doesn't match what the chunks sum to
        let mut req = initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde"));
        req.total_file_size = 99;
        req.checksum = None;
        let session = mgr.initiate("user-1", &req).unwrap();

        let err = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                0,
                &chunks[0].chunk_data,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Integrity(_)));
        assert_eq!(
            mgr.status("user-1", &session.session_id).unwrap().status,
            SessionStatus::Failed
        );
    }

    #[test]
    fn test_cancel_transitions_to_failed_and_clears_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let chunks = make_chunks(b"0123456789", 5);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 10, &sha256_hex(b"0123456789")),
            )
            .unwrap();
        mgr.receive_chunk(
            "user-1",
            &session.session_id,
            0,
            &chunks[0].chunk_data,
            None,
        )
        .unwrap();

        let dto = mgr.cancel("user-1", &session.session_id).unwrap();
        assert_eq!(dto.status, SessionStatus::Failed);

        // Further chunks are refused
        let err = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                1,
                &chunks[1].chunk_data,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_wrong_user_is_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let chunks = make_chunks(b"abcde", 5);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();

        assert!(matches!(
            mgr.status("user-2", &session.session_id).unwrap_err(),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            mgr.receive_chunk("user-2", &session.session_id, 0, b"a", None)
                .unwrap_err(),
            ApiError::Forbidden(_)
        ));
    }

    #[test]
    fn test_per_user_session_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(
            BlobStore::new(dir.path()),
            SessionConfig {
                max_active_per_user: 2,
                ..Default::default()
            },
        );

        let chunks = make_chunks(b"abcde", 5);
        for i in 0..2 {
            mgr.initiate(
                "user-1",
                &initiate_request(&format!("f{}.bin", i), &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();
        }
        let err = mgr
            .initiate(
                "user-1",
                &initiate_request("f9.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn test_new_session_supersedes_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let chunks = make_chunks(b"abcde", 5);
        let first = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();
        let second = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(
            mgr.status("user-1", &first.session_id).unwrap().status,
            SessionStatus::Failed
        );
        assert_eq!(
            mgr.status("user-1", &second.session_id).unwrap().status,
            SessionStatus::InProgress
        );
    }

    #[test]
    fn test_sweep_expires_overdue_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(
            BlobStore::new(dir.path()),
            SessionConfig {
                ttl: Duration::from_secs(0),
                ..Default::default()
            },
        );

        let chunks = make_chunks(b"abcde", 5);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 5, &sha256_hex(b"abcde")),
            )
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        mgr.sweep();

        let status = mgr.status("user-1", &session.session_id).unwrap();
        assert_eq!(status.status, SessionStatus::Expired);

        // Chunks after expiry are refused with the session-expired error
        let err = mgr
            .receive_chunk(
                "user-1",
                &session.session_id,
                0,
                &chunks[0].chunk_data,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionExpired(_)));
    }

    #[test]
    fn test_received_count_matches_bitset_popcount() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let content: Vec<u8> = (0..30u8).collect();
        let chunks = make_chunks(&content, 10);
        let session = mgr
            .initiate(
                "user-1",
                &initiate_request("a.bin", &chunks, 30, &sha256_hex(&content)),
            )
            .unwrap();

        for chunk in chunks.iter().take(2) {
            mgr.receive_chunk(
                "user-1",
                &session.session_id,
                chunk.chunk_index,
                &chunk.chunk_data,
                None,
            )
            .unwrap();
        }

        let status = mgr.status("user-1", &session.session_id).unwrap();
        let popcount = status.received_bitset.iter().filter(|b| **b).count() as u32;
        assert_eq!(status.received_chunks, popcount);
    }
}
