//! Upload queue and local sync state.
//!
//! The client engine: a persisted map of what we believe the server has,
//! the tombstone map for deliberately deleted paths, and a bounded FIFO of
//! sync intents drained by worker tasks. At most one sync request is in
//! flight per path; intents arriving while a path is in flight coalesce into
//! a follow-up that runs when the current request completes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::SyncApi;
use crate::chunking;
use crate::conflict::{self, PendingConflict, ResolutionChoice};
use crate::error::{Error, Result};
use crate::protocol::{
    InitiateUploadRequest, SyncEventDto, SyncEventType, SyncResponseDto,
};
use crate::transport::IncomingEvent;
use crate::version_vector::VersionVector;
use crate::watcher::{PathEvent, SyncIntent};

/// Capacity of the upload queue.
const QUEUE_CAPACITY: usize = 1024;

/// Attempts for a retriable server failure, with doubling backoff.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Window during which watcher events on a path we just wrote are ignored.
const SELF_WRITE_SUPPRESSION: Duration = Duration::from_secs(5);

/// Range size used when downloading large files.
const DOWNLOAD_RANGE_SIZE: u64 = 5 * 1024 * 1024;

// ── Persisted local state ─────────────────────────────────────────────────────

/// What the client believes the server holds for one path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFileState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub version_vector: VersionVector,
    pub checksum: String,
    pub file_size: u64,
    /// True once the server confirmed this exact content.
    pub synced: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    files: BTreeMap<String, LocalFileState>,
    /// path → when the user deleted it. Blocks re-download until a new
    /// byte-sequence appears at the path.
    tombstones: BTreeMap<String, DateTime<Utc>>,
    conflicts: BTreeMap<String, PendingConflict>,
    /// High-water mark for event catch-up after reconnects.
    #[serde(skip_serializing_if = "Option::is_none")]
    last_event_at: Option<DateTime<Utc>>,
}

/// Durable client-side sync state, saved as JSON beside the config file.
pub struct LocalStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl LocalStore {
    /// Load the state file; a missing file starts empty.
    pub fn load(path: &Path) -> Result<Self> {
        let state = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| Error::StateCorrupted(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(Error::Io(e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    /// Write the state file.
    pub fn save(&self) -> Result<()> {
        let json = {
            let state = self.state.lock().expect("state lock");
            serde_json::to_string_pretty(&*state)?
        };
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn file(&self, rel_path: &str) -> Option<LocalFileState> {
        self.state
            .lock()
            .expect("state lock")
            .files
            .get(rel_path)
            .cloned()
    }

    pub fn set_file(&self, rel_path: &str, state: LocalFileState) {
        self.state
            .lock()
            .expect("state lock")
            .files
            .insert(rel_path.to_string(), state);
    }

    pub fn remove_file(&self, rel_path: &str) {
        self.state
            .lock()
            .expect("state lock")
            .files
            .remove(rel_path);
    }

    pub fn known_paths(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("state lock")
            .files
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_tombstoned(&self, rel_path: &str) -> bool {
        self.state
            .lock()
            .expect("state lock")
            .tombstones
            .contains_key(rel_path)
    }

    pub fn set_tombstone(&self, rel_path: &str) {
        self.state
            .lock()
            .expect("state lock")
            .tombstones
            .insert(rel_path.to_string(), Utc::now());
    }

    /// Clear a tombstone. Returns true when one was present.
    pub fn clear_tombstone(&self, rel_path: &str) -> bool {
        self.state
            .lock()
            .expect("state lock")
            .tombstones
            .remove(rel_path)
            .is_some()
    }

    pub fn tombstones(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state
            .lock()
            .expect("state lock")
            .tombstones
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    pub fn record_conflict(&self, conflict: PendingConflict) {
        self.state
            .lock()
            .expect("state lock")
            .conflicts
            .insert(conflict.file_path.clone(), conflict);
    }

    pub fn conflict(&self, rel_path: &str) -> Option<PendingConflict> {
        self.state
            .lock()
            .expect("state lock")
            .conflicts
            .get(rel_path)
            .cloned()
    }

    pub fn clear_conflict(&self, rel_path: &str) {
        self.state
            .lock()
            .expect("state lock")
            .conflicts
            .remove(rel_path);
    }

    pub fn conflicts(&self) -> Vec<PendingConflict> {
        self.state
            .lock()
            .expect("state lock")
            .conflicts
            .values()
            .cloned()
            .collect()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().expect("state lock").last_event_at
    }

    pub fn set_last_event_at(&self, at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("state lock");
        if state.last_event_at.map_or(true, |prev| at > prev) {
            state.last_event_at = Some(at);
        }
    }
}

// ── Sync client ───────────────────────────────────────────────────────────────

/// One queued unit of work.
#[derive(Debug, Clone)]
struct QueueItem {
    rel_path: String,
    intent: SyncIntent,
}

/// The client sync engine: queue, workers, and remote-event application.
pub struct SyncClient {
    api: Arc<SyncApi>,
    store: Arc<LocalStore>,
    root: PathBuf,
    client_id: String,
    queue_tx: mpsc::Sender<QueueItem>,
    /// path → coalesced follow-up intent. Presence of a key means the path
    /// is queued or in flight.
    in_flight: DashMap<String, Option<SyncIntent>>,
    /// Paths we just wrote ourselves; watcher echoes are suppressed.
    self_writes: DashMap<String, std::time::Instant>,
}

impl SyncClient {
    /// Build the engine and start `workers` queue drainers.
    pub fn spawn(
        api: Arc<SyncApi>,
        store: Arc<LocalStore>,
        root: PathBuf,
        client_id: String,
        workers: usize,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let client = Arc::new(Self {
            api,
            store,
            root,
            client_id,
            queue_tx,
            in_flight: DashMap::new(),
            self_writes: DashMap::new(),
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        for worker_id in 0..workers.max(1) {
            let client = client.clone();
            let queue_rx = queue_rx.clone();
            tokio::spawn(async move {
                client.worker_loop(worker_id, queue_rx).await;
            });
        }

        client
    }

    /// The sync root this client manages.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The REST client this engine submits through.
    pub fn api(&self) -> &SyncApi {
        &self.api
    }

    /// The persisted local sync state.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// This installation's client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Normalize an absolute path to the forward-slash relative form used on
    /// the wire. Paths outside the root are rejected.
    pub fn rel_path(&self, abs: &Path) -> Result<String> {
        let rel = abs
            .strip_prefix(&self.root)
            .map_err(|_| Error::InvalidPath(format!("{} is outside the sync root", abs.display())))?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return Err(Error::InvalidPath("empty relative path".into()));
        }
        Ok(parts.join("/"))
    }

    fn abs_path(&self, rel_path: &str) -> PathBuf {
        let mut abs = self.root.clone();
        for part in rel_path.split('/') {
            abs.push(part);
        }
        abs
    }

    /// Feed a debounced watcher event into the queue.
    pub async fn handle_path_event(&self, event: PathEvent) {
        let rel = match self.rel_path(&event.path) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring watch event");
                return;
            }
        };

        if self.suppress_self_write(&rel) {
            tracing::debug!(path = rel.as_str(), "Ignoring echo of our own write");
            return;
        }

        self.enqueue(rel, event.intent).await;
    }

    /// Queue a sync intent, coalescing when the path is already in flight.
    pub async fn enqueue(&self, rel_path: String, intent: SyncIntent) {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(rel_path.clone()) {
            Entry::Occupied(mut slot) => {
                let merged = match slot.get() {
                    Some(pending) => coalesce_follow_up(*pending, intent),
                    None => intent,
                };
                slot.insert(Some(merged));
                tracing::debug!(path = rel_path.as_str(), "Coalesced intent into in-flight sync");
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
                if self
                    .queue_tx
                    .send(QueueItem {
                        rel_path: rel_path.clone(),
                        intent,
                    })
                    .await
                    .is_err()
                {
                    self.in_flight.remove(&rel_path);
                    tracing::warn!(path = rel_path.as_str(), "Upload queue closed, dropping intent");
                }
            }
        }
    }

    /// Import a file from outside the sync root by copying it in; the copy
    /// then syncs as a normal create.
    pub async fn import_external(&self, source: &Path) -> Result<String> {
        let name = source
            .file_name()
            .ok_or_else(|| Error::InvalidPath(format!("{} has no file name", source.display())))?;
        let target = self.root.join(name);
        tokio::fs::copy(source, &target).await?;

        let rel = self.rel_path(&target)?;
        tracing::info!(from = %source.display(), to = rel.as_str(), "Imported external file");
        self.enqueue(rel.clone(), SyncIntent::Create).await;
        Ok(rel)
    }

    // ── Worker ────────────────────────────────────────────────────────────

    async fn worker_loop(
        &self,
        worker_id: usize,
        queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    ) {
        loop {
            let item = {
                let mut rx = queue_rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else {
                tracing::debug!(worker = worker_id, "Upload queue closed, worker exiting");
                return;
            };

            let mut current = item.intent;
            loop {
                if let Err(e) = self.process(&item.rel_path, current).await {
                    tracing::warn!(
                        path = item.rel_path.as_str(),
                        error = %e,
                        "Sync task failed"
                    );
                }

                // Release the in-flight slot, unless a follow-up intent was
                // coalesced in while we were processing, in which case this
                // worker keeps the slot and runs it too. The conditional
                // remove is atomic, so a follow-up can neither be lost nor
                // start a second in-flight sync for the path.
                if self
                    .in_flight
                    .remove_if(&item.rel_path, |_, pending| pending.is_none())
                    .is_some()
                {
                    break;
                }
                match self
                    .in_flight
                    .get_mut(&item.rel_path)
                    .and_then(|mut slot| slot.take())
                {
                    Some(follow_up) => current = follow_up,
                    None => break,
                }
            }
        }
    }

    async fn process(&self, rel_path: &str, intent: SyncIntent) -> Result<()> {
        match intent {
            SyncIntent::Create | SyncIntent::Modify => self.process_upload(rel_path).await,
            SyncIntent::Delete => self.process_delete(rel_path).await,
        }
    }

    /// Upload the current on-disk content of a path.
    async fn process_upload(&self, rel_path: &str) -> Result<()> {
        let abs = self.abs_path(rel_path);
        let bytes = match tokio::fs::read(&abs).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Vanished between the event and the worker; treat as delete.
                return self.process_delete(rel_path).await;
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let checksum = chunking::sha256_hex(&bytes);
        let file_size = bytes.len() as u64;

        if let Some(state) = self.store.file(rel_path) {
            if state.synced && state.checksum == checksum {
                tracing::debug!(path = rel_path, "Content unchanged, skipping upload");
                return Ok(());
            }
        }

        // A new byte-sequence at a tombstoned path clears the tombstone.
        if self.store.clear_tombstone(rel_path) {
            tracing::info!(path = rel_path, "Tombstone cleared by re-created file");
        }

        let mut vector = self
            .store
            .file(rel_path)
            .map(|s| s.version_vector)
            .unwrap_or_default();
        vector.increment(&self.client_id);

        let file_id = self.store.file(rel_path).and_then(|s| s.file_id);
        let response = self
            .submit_with_retry(rel_path, file_id, bytes, &checksum, file_size, &vector)
            .await?;

        self.apply_sync_response(rel_path, &checksum, file_size, vector, response)
            .await
    }

    async fn submit_with_retry(
        &self,
        rel_path: &str,
        file_id: Option<String>,
        bytes: Vec<u8>,
        checksum: &str,
        file_size: u64,
        vector: &VersionVector,
    ) -> Result<SyncResponseDto> {
        let mut backoff = RETRY_BACKOFF;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .submit_once(rel_path, file_id.clone(), bytes.clone(), checksum, file_size, vector)
                .await;
            match result {
                Err(e) if e.is_retriable() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(
                        path = rel_path,
                        attempt,
                        error = %e,
                        "Retriable upload failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }

    async fn submit_once(
        &self,
        rel_path: &str,
        file_id: Option<String>,
        bytes: Vec<u8>,
        checksum: &str,
        file_size: u64,
        vector: &VersionVector,
    ) -> Result<SyncResponseDto> {
        let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();

        if !chunking::needs_chunking(file_size) {
            return match file_id {
                Some(id) => {
                    self.api
                        .update_file(&id, &file_name, bytes, &self.client_id, vector)
                        .await
                }
                None => {
                    self.api
                        .upload_file(rel_path, &file_name, bytes, &self.client_id, vector)
                        .await
                }
            };
        }

        // Large file: chunk upload session
        let chunks = chunking::split(&bytes);
        let session = self
            .api
            .initiate_chunked(&InitiateUploadRequest {
                file_id,
                file_path: rel_path.to_string(),
                total_chunks: chunks.len() as u32,
                total_file_size: file_size,
                checksum: Some(checksum.to_string()),
                client_id: self.client_id.clone(),
                version_vector: vector.clone(),
            })
            .await?;

        let mut final_result = None;
        for chunk in &chunks {
            let receipt = self.api.upload_chunk(&session.session_id, chunk).await?;
            if let Some(result) = receipt.sync_result {
                final_result = Some(result);
            }
        }

        final_result.ok_or_else(|| {
            Error::AssemblyFailed(format!(
                "session {} never completed ({} chunks sent)",
                session.session_id,
                chunks.len()
            ))
        })
    }

    async fn apply_sync_response(
        &self,
        rel_path: &str,
        checksum: &str,
        file_size: u64,
        sent_vector: VersionVector,
        response: SyncResponseDto,
    ) -> Result<()> {
        match response {
            SyncResponseDto::Success { file } => {
                self.store.set_file(
                    rel_path,
                    LocalFileState {
                        file_id: Some(file.file_id),
                        version_vector: file.version_vector,
                        checksum: checksum.to_string(),
                        file_size,
                        synced: true,
                    },
                );
                self.store.clear_conflict(rel_path);
                self.store.save()?;
                tracing::info!(path = rel_path, "Upload accepted");
                Ok(())
            }
            SyncResponseDto::Conflict {
                conflict_version_id,
                ..
            } => {
                // Keep the bumped vector so resolution submits a successor.
                let file_id = self.store.file(rel_path).and_then(|s| s.file_id);
                self.store.set_file(
                    rel_path,
                    LocalFileState {
                        file_id: file_id.clone(),
                        version_vector: sent_vector,
                        checksum: checksum.to_string(),
                        file_size,
                        synced: false,
                    },
                );
                self.store.record_conflict(PendingConflict {
                    file_id,
                    file_path: rel_path.to_string(),
                    conflict_version_id: Some(conflict_version_id.clone()),
                    detected_at: Utc::now(),
                });
                self.store.save()?;
                tracing::warn!(
                    path = rel_path,
                    conflict_version = conflict_version_id.as_str(),
                    "Server reported conflict"
                );
                Err(Error::Conflict {
                    path: rel_path.to_string(),
                    conflict_version_id,
                })
            }
            SyncResponseDto::ClientShouldUpdate { .. } => {
                tracing::info!(path = rel_path, "Server holds newer version, downloading");
                self.download_current(rel_path).await?;
                Err(Error::ClientShouldUpdate(rel_path.to_string()))
            }
            SyncResponseDto::Error { message } => Err(Error::ServerError {
                status: 500,
                message,
            }),
        }
    }

    /// Tombstone a locally deleted path and propagate the delete.
    async fn process_delete(&self, rel_path: &str) -> Result<()> {
        self.store.set_tombstone(rel_path);

        let Some(state) = self.store.file(rel_path) else {
            // Never synced; nothing to tell the server.
            self.store.save()?;
            return Ok(());
        };
        let Some(file_id) = state.file_id.clone() else {
            self.store.save()?;
            return Ok(());
        };

        let mut vector = state.version_vector.clone();
        vector.increment(&self.client_id);

        match self.api.delete_file(&file_id, &self.client_id, &vector).await? {
            SyncResponseDto::Success { .. } => {
                self.store.remove_file(rel_path);
                self.store.save()?;
                tracing::info!(path = rel_path, "Delete accepted");
                Ok(())
            }
            SyncResponseDto::Conflict {
                conflict_version_id,
                ..
            } => {
                self.store.record_conflict(PendingConflict {
                    file_id: Some(file_id),
                    file_path: rel_path.to_string(),
                    conflict_version_id: Some(conflict_version_id.clone()),
                    detected_at: Utc::now(),
                });
                self.store.save()?;
                Err(Error::Conflict {
                    path: rel_path.to_string(),
                    conflict_version_id,
                })
            }
            SyncResponseDto::ClientShouldUpdate { .. } => {
                // Someone edited after our snapshot; fetch their version
                // instead of deleting it.
                self.store.clear_tombstone(rel_path);
                self.download_current(rel_path).await?;
                Err(Error::ClientShouldUpdate(rel_path.to_string()))
            }
            SyncResponseDto::Error { message } => Err(Error::ServerError {
                status: 500,
                message,
            }),
        }
    }

    // ── Remote events ─────────────────────────────────────────────────────

    /// Apply an event delivered over the socket (or replayed from the events
    /// endpoint). Safe to call repeatedly with the same event; application
    /// is idempotent via checksum comparison.
    pub async fn apply_remote_event(&self, incoming: IncomingEvent) -> Result<()> {
        match incoming {
            IncomingEvent::FileChange(event) => {
                self.store.set_last_event_at(event.timestamp);
                match event.event_type {
                    SyncEventType::Create | SyncEventType::Modify => {
                        self.apply_remote_change(&event).await
                    }
                    SyncEventType::Delete => self.apply_remote_delete(&event).await,
                    _ => Ok(()),
                }
            }
            IncomingEvent::Conflict(event) => {
                self.store.set_last_event_at(event.timestamp);
                let Some(path) = event.file_path.clone() else {
                    return Ok(());
                };
                self.store.record_conflict(PendingConflict {
                    file_id: event.file_id.clone(),
                    file_path: path.clone(),
                    conflict_version_id: None,
                    detected_at: event.timestamp,
                });
                self.store.save()?;
                tracing::warn!(path = path.as_str(), "Conflict reported by server");
                Ok(())
            }
        }
    }

    async fn apply_remote_change(&self, event: &SyncEventDto) -> Result<()> {
        if event.client_id == self.client_id {
            return Ok(()); // our own change echoed back
        }
        let Some(rel_path) = event.file_path.clone() else {
            return Ok(());
        };

        if self.store.is_tombstoned(&rel_path) {
            tracing::debug!(path = rel_path.as_str(), "Tombstoned path, skipping download");
            return Ok(());
        }

        if let (Some(state), Some(checksum)) = (self.store.file(&rel_path), &event.checksum) {
            if state.checksum == *checksum {
                // Already have these bytes; just track the vector.
                if let Some(vector) = &event.version_vector {
                    self.store.set_file(
                        &rel_path,
                        LocalFileState {
                            version_vector: vector.clone(),
                            synced: true,
                            ..state
                        },
                    );
                    self.store.save()?;
                }
                return Ok(());
            }
        }

        let Some(file_id) = event.file_id.clone() else {
            return Ok(());
        };
        self.download_to_disk(&rel_path, &file_id, event.file_size, event.checksum.as_deref())
            .await?;

        self.store.set_file(
            &rel_path,
            LocalFileState {
                file_id: Some(file_id),
                version_vector: event.version_vector.clone().unwrap_or_default(),
                checksum: event.checksum.clone().unwrap_or_default(),
                file_size: event.file_size.unwrap_or_default(),
                synced: true,
            },
        );
        self.store.save()?;
        tracing::info!(path = rel_path.as_str(), "Downloaded remote change");
        Ok(())
    }

    async fn apply_remote_delete(&self, event: &SyncEventDto) -> Result<()> {
        if event.client_id == self.client_id {
            return Ok(());
        }
        let Some(rel_path) = event.file_path.clone() else {
            return Ok(());
        };

        let abs = self.abs_path(&rel_path);
        self.mark_self_write(&rel_path);
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        self.store.remove_file(&rel_path);
        self.store.set_tombstone(&rel_path);
        self.store.save()?;
        tracing::info!(path = rel_path.as_str(), "Applied remote delete");
        Ok(())
    }

    /// Fetch the server's current copy of a path and overwrite local state.
    /// Works even when the local store has never seen the path (fresh
    /// install): the file is resolved through the server's listing.
    pub async fn download_current(&self, rel_path: &str) -> Result<()> {
        let dto = self
            .api
            .list_files()
            .await?
            .into_iter()
            .find(|f| f.file_path == rel_path)
            .ok_or_else(|| Error::NotFound(format!("{} is not on the server", rel_path)))?;

        self.download_to_disk(
            rel_path,
            &dto.file_id,
            Some(dto.file_size),
            Some(&dto.checksum),
        )
        .await?;

        self.store.set_file(
            rel_path,
            LocalFileState {
                file_id: Some(dto.file_id),
                version_vector: dto.version_vector,
                checksum: dto.checksum,
                file_size: dto.file_size,
                synced: true,
            },
        );
        self.store.save()?;
        Ok(())
    }

    async fn download_to_disk(
        &self,
        rel_path: &str,
        file_id: &str,
        file_size: Option<u64>,
        expected_checksum: Option<&str>,
    ) -> Result<()> {
        let bytes = match file_size {
            Some(size) if chunking::needs_chunking(size) => {
                self.api
                    .download_in_ranges(file_id, size, DOWNLOAD_RANGE_SIZE)
                    .await?
            }
            _ => self.api.download(file_id).await?,
        };

        if let Some(expected) = expected_checksum {
            let actual = chunking::sha256_hex(&bytes);
            if actual != expected {
                return Err(Error::AssemblyFailed(format!(
                    "downloaded {} checksum mismatch: expected {}, got {}",
                    rel_path, expected, actual
                )));
            }
        }

        let abs = self.abs_path(rel_path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.mark_self_write(rel_path);
        tokio::fs::write(&abs, &bytes).await?;
        Ok(())
    }

    // ── Conflict resolution ───────────────────────────────────────────────

    /// Build the merge-pane seed for a conflicted text file.
    pub async fn merge_seed_for(&self, rel_path: &str) -> Result<String> {
        let abs = self.abs_path(rel_path);
        let local = tokio::fs::read_to_string(&abs).await.unwrap_or_default();

        let state = self
            .store
            .file(rel_path)
            .ok_or_else(|| Error::NotFound(format!("no local record of {}", rel_path)))?;
        let file_id = state
            .file_id
            .ok_or_else(|| Error::NotFound(format!("no file id for {}", rel_path)))?;
        let server_bytes = self.api.download(&file_id).await?;
        let server = String::from_utf8_lossy(&server_bytes).into_owned();

        Ok(conflict::merge_seed(&local, &server))
    }

    /// Dispatch the user's resolution of a pending conflict.
    ///
    /// Choices that re-submit content first absorb the server's merged
    /// vector, so the submission is a strict successor and the server
    /// accepts it instead of flagging the same conflict again.
    pub async fn resolve_conflict(
        &self,
        rel_path: &str,
        choice: ResolutionChoice,
    ) -> Result<()> {
        match choice {
            ResolutionChoice::UseLocal => {
                self.absorb_server_vector(rel_path).await?;
                self.store.clear_conflict(rel_path);
                self.store.save()?;
                self.process_upload(rel_path).await?;
            }
            ResolutionChoice::UseServer => {
                self.download_current(rel_path).await?;
                self.store.clear_conflict(rel_path);
                self.store.save()?;
            }
            ResolutionChoice::UseMerged(bytes) => {
                let abs = self.abs_path(rel_path);
                self.mark_self_write(rel_path);
                tokio::fs::write(&abs, &bytes).await?;
                self.absorb_server_vector(rel_path).await?;
                self.store.clear_conflict(rel_path);
                self.store.save()?;
                self.process_upload(rel_path).await?;
            }
            ResolutionChoice::Cancelled => {
                tracing::info!(path = rel_path, "Conflict resolution cancelled");
            }
        }
        Ok(())
    }

    /// Merge the server's current vector for a path into the local record.
    async fn absorb_server_vector(&self, rel_path: &str) -> Result<()> {
        let Some(dto) = self
            .api
            .list_files()
            .await?
            .into_iter()
            .find(|f| f.file_path == rel_path)
        else {
            return Ok(());
        };

        match self.store.file(rel_path) {
            Some(mut state) => {
                state.version_vector = state.version_vector.merge(&dto.version_vector);
                state.file_id = state.file_id.or(Some(dto.file_id));
                state.synced = false;
                self.store.set_file(rel_path, state);
            }
            None => {
                self.store.set_file(
                    rel_path,
                    LocalFileState {
                        file_id: Some(dto.file_id),
                        version_vector: dto.version_vector,
                        checksum: String::new(),
                        file_size: 0,
                        synced: false,
                    },
                );
            }
        }
        Ok(())
    }

    // ── Self-write suppression ────────────────────────────────────────────

    fn mark_self_write(&self, rel_path: &str) {
        self.self_writes
            .insert(rel_path.to_string(), std::time::Instant::now());
    }

    fn suppress_self_write(&self, rel_path: &str) -> bool {
        if let Some((_, written_at)) = self.self_writes.remove(rel_path) {
            if written_at.elapsed() < SELF_WRITE_SUPPRESSION {
                return true;
            }
        }
        false
    }
}

/// Merge a second follow-up intent into one already waiting.
fn coalesce_follow_up(earlier: SyncIntent, later: SyncIntent) -> SyncIntent {
    match (earlier, later) {
        (SyncIntent::Create, SyncIntent::Modify) => SyncIntent::Create,
        (SyncIntent::Delete, SyncIntent::Create) => SyncIntent::Modify,
        (_, later) => later,
    }
}
