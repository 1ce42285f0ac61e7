//! Periodic reconciliation.
//!
//! The watcher catches live changes; this pass catches everything it missed:
//! changes made while the daemon was down, events dropped over a flaky
//! socket, and partially applied downloads. It compares the server's file
//! list against the local tree and state, then feeds the differences back
//! through the normal sync pipeline.

use std::path::PathBuf;

use crate::chunking;
use crate::error::Result;
use crate::protocol::{EventStatus, FileDto, SyncEventDto, SyncEventType, SyncStatus};
use crate::queue::SyncClient;
use crate::transport::IncomingEvent;
use crate::watcher::SyncIntent;

/// What one reconciliation pass decided to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub downloads: usize,
    pub uploads: usize,
    pub deletes: usize,
}

/// Run one reconciliation pass.
pub async fn reconcile_once(client: &SyncClient) -> Result<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let server_files = client.api().list_files().await?;
    let local_files = walk_local_tree(client).await?;

    for file in &server_files {
        let rel_path = file.file_path.clone();

        if file.sync_status == SyncStatus::Deleted {
            // Server-side tombstone: drop an unchanged local copy; a changed
            // one is the user re-creating the path and re-uploads instead.
            if local_files.contains(&rel_path) {
                let unchanged = match client.store().file(&rel_path) {
                    Some(state) => {
                        let checksum = local_checksum(client, &rel_path).await.unwrap_or_default();
                        state.checksum == checksum
                    }
                    None => false,
                };
                if unchanged {
                    client
                        .apply_remote_event(IncomingEvent::FileChange(synthetic_event(
                            file,
                            SyncEventType::Delete,
                        )))
                        .await?;
                    report.deletes += 1;
                } else {
                    client.enqueue(rel_path.clone(), SyncIntent::Modify).await;
                    report.uploads += 1;
                }
            }
            continue;
        }

        if client.store().is_tombstoned(&rel_path) {
            continue;
        }

        if !local_files.contains(&rel_path) {
            client
                .apply_remote_event(IncomingEvent::FileChange(synthetic_event(
                    file,
                    SyncEventType::Modify,
                )))
                .await?;
            report.downloads += 1;
            continue;
        }

        let Some(checksum) = local_checksum(client, &rel_path).await else {
            continue; // vanished mid-pass; the watcher will report it
        };
        if checksum == file.checksum {
            continue;
        }

        // Divergent content: let the vectors decide the direction.
        let local_vector = client
            .store()
            .file(&rel_path)
            .map(|s| s.version_vector)
            .unwrap_or_default();

        if file.version_vector.dominates(&local_vector)
            && file.version_vector != local_vector
        {
            client
                .apply_remote_event(IncomingEvent::FileChange(synthetic_event(
                    file,
                    SyncEventType::Modify,
                )))
                .await?;
            report.downloads += 1;
        } else {
            // Local edits not yet submitted (or concurrent; the decision
            // engine classifies that on submission).
            client.enqueue(rel_path.clone(), SyncIntent::Modify).await;
            report.uploads += 1;
        }
    }

    // Local files the server has never seen
    for rel_path in &local_files {
        if client.store().is_tombstoned(rel_path) {
            continue;
        }
        if !server_files.iter().any(|f| &f.file_path == rel_path) {
            client.enqueue(rel_path.clone(), SyncIntent::Create).await;
            report.uploads += 1;
        }
    }

    tracing::info!(
        downloads = report.downloads,
        uploads = report.uploads,
        deletes = report.deletes,
        "Reconciliation pass complete"
    );
    Ok(report)
}

/// Collect the relative paths of every regular file under the sync root.
async fn walk_local_tree(client: &SyncClient) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack: Vec<PathBuf> = vec![client.root().to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = client.rel_path(&path) {
                    files.push(rel);
                }
            }
        }
    }

    Ok(files)
}

async fn local_checksum(client: &SyncClient, rel_path: &str) -> Option<String> {
    let mut abs = client.root().to_path_buf();
    for part in rel_path.split('/') {
        abs.push(part);
    }
    tokio::fs::read(&abs)
        .await
        .ok()
        .map(|bytes| chunking::sha256_hex(&bytes))
}

/// Wrap a file listing row as the event the live pipeline would have seen.
fn synthetic_event(file: &FileDto, event_type: SyncEventType) -> SyncEventDto {
    SyncEventDto {
        event_id: format!("reconcile-{}", file.file_id),
        event_type,
        user_id: file.user_id.clone(),
        file_id: Some(file.file_id.clone()),
        file_path: Some(file.file_path.clone()),
        checksum: Some(file.checksum.clone()),
        file_size: Some(file.file_size),
        client_id: "reconcile".to_string(),
        timestamp: file.modified_at,
        sync_status: EventStatus::Completed,
        version_vector: Some(file.version_vector.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::protocol::ConflictStatus;
    use crate::version_vector::VersionVector;

    #[test]
    fn test_synthetic_event_carries_file_fields() {
        let file = FileDto {
            file_id: "file-1".to_string(),
            user_id: "user-1".to_string(),
            file_path: "docs/readme.md".to_string(),
            file_name: "readme.md".to_string(),
            file_size: 13,
            checksum: "abc".to_string(),
            version_vector: VersionVector::initial("client-a"),
            sync_status: SyncStatus::Synced,
            conflict_status: ConflictStatus::None,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        };

        let event = synthetic_event(&file, SyncEventType::Modify);
        assert_eq!(event.file_path.as_deref(), Some("docs/readme.md"));
        assert_eq!(event.checksum.as_deref(), Some("abc"));
        assert_eq!(event.event_type, SyncEventType::Modify);
        assert!(event.version_vector.is_some());
    }
}
