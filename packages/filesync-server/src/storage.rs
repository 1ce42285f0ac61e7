//! Blob storage.
//!
//! Current versions live at `{base}/{user_id}/{YYYY}/{MM}/{file_id}`;
//! conflict versions go into a `conflicts/` sub-namespace keyed by file,
//! client, and submission time so every losing submission stays
//! addressable. The database stores the forward-slash relative form and the
//! store joins it with the base at access time.
//!
//! Chunk staging gets one isolated directory per upload session, safe to
//! write concurrently across sessions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::error::{ApiError, ApiResult};

/// Disk-backed store for version blobs and chunk staging.
#[derive(Clone)]
pub struct BlobStore {
    base: PathBuf,
    staging: PathBuf,
}

impl BlobStore {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            staging: base.join(".staging"),
        }
    }

    // ── Path allocation ───────────────────────────────────────────────────

    /// Relative storage path for a current version:
    /// `user_id/YYYY/MM/file_id`.
    pub fn version_path(user_id: &str, file_id: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}/{:04}/{:02}/{}",
            user_id,
            now.year(),
            now.month(),
            file_id
        )
    }

    /// Relative storage path for a conflict version:
    /// `user_id/YYYY/MM/conflicts/{file_id}_{client_id}_{epoch_millis}`.
    pub fn conflict_path(
        user_id: &str,
        file_id: &str,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> String {
        format!(
            "{}/{:04}/{:02}/conflicts/{}_{}_{}",
            user_id,
            now.year(),
            now.month(),
            file_id,
            client_id,
            now.timestamp_millis()
        )
    }

    /// Join a stored relative path with the base, in the native separator.
    pub fn absolute(&self, storage_path: &str) -> PathBuf {
        let mut abs = self.base.clone();
        for part in storage_path.split('/') {
            abs.push(part);
        }
        abs
    }

    // ── Version blobs ─────────────────────────────────────────────────────

    /// Write a version blob, creating parent directories on demand.
    pub fn write(&self, storage_path: &str, bytes: &[u8]) -> ApiResult<()> {
        let abs = self.absolute(storage_path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::Storage(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        std::fs::write(&abs, bytes)
            .map_err(|e| ApiError::Storage(format!("write {}: {}", abs.display(), e)))?;
        tracing::debug!(path = storage_path, size = bytes.len(), "Stored blob");
        Ok(())
    }

    pub fn read(&self, storage_path: &str) -> ApiResult<Vec<u8>> {
        let abs = self.absolute(storage_path);
        std::fs::read(&abs).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ApiError::NotFound(format!("blob {} is missing", storage_path))
            }
            _ => ApiError::Storage(format!("read {}: {}", abs.display(), e)),
        })
    }

    /// Open a blob for streaming (range downloads).
    pub async fn open(&self, storage_path: &str) -> ApiResult<tokio::fs::File> {
        let abs = self.absolute(storage_path);
        tokio::fs::File::open(&abs).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ApiError::NotFound(format!("blob {} is missing", storage_path))
            }
            _ => ApiError::Storage(format!("open {}: {}", abs.display(), e)),
        })
    }

    /// Remove a blob; missing blobs are fine (used for rollback).
    pub fn remove(&self, storage_path: &str) {
        let abs = self.absolute(storage_path);
        match std::fs::remove_file(&abs) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = storage_path, error = %e, "Failed to remove blob");
            }
        }
    }

    // ── Chunk staging ─────────────────────────────────────────────────────

    fn staging_dir(&self, session_id: &str) -> PathBuf {
        self.staging.join(session_id)
    }

    fn chunk_path(&self, session_id: &str, chunk_index: u32) -> PathBuf {
        self.staging_dir(session_id).join(format!("{}.chunk", chunk_index))
    }

    /// Persist one chunk into the session's staging directory.
    pub fn stage_chunk(&self, session_id: &str, chunk_index: u32, bytes: &[u8]) -> ApiResult<()> {
        let dir = self.staging_dir(session_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| ApiError::Storage(format!("mkdir {}: {}", dir.display(), e)))?;
        let path = self.chunk_path(session_id, chunk_index);
        std::fs::write(&path, bytes)
            .map_err(|e| ApiError::Storage(format!("stage chunk {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn read_chunk(&self, session_id: &str, chunk_index: u32) -> ApiResult<Vec<u8>> {
        let path = self.chunk_path(session_id, chunk_index);
        std::fs::read(&path).map_err(|e| {
            ApiError::Storage(format!("read staged chunk {}: {}", path.display(), e))
        })
    }

    /// Delete a session's entire staging directory.
    pub fn remove_staging(&self, session_id: &str) {
        let dir = self.staging_dir(session_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(session = session_id, "Removed staging directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "Failed to remove staging");
            }
        }
    }
}
