//! Local filesystem watcher.
//!
//! Watches the sync root recursively and turns raw notify events into
//! debounced sync intents: rapid-fire events on the same path within the
//! debounce window collapse into a single intent. Editors that write via
//! rename produce create/remove pairs; intents are derived from what is on
//! disk once the window closes, not from the raw event kind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::Result;

/// Quiet period a path must see before its intent is emitted.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

/// What a filesystem change means for the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncIntent {
    Create,
    Modify,
    Delete,
}

/// A debounced change on one path.
#[derive(Debug, Clone)]
pub struct PathEvent {
    pub path: PathBuf,
    pub intent: SyncIntent,
}

/// Keeps the underlying watcher alive; dropping it stops the event stream.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
}

/// Start watching `root` recursively.
///
/// Must be called from within a tokio runtime; the debounce loop runs as a
/// background task and ends when the returned receiver is dropped.
pub fn watch(root: &Path) -> Result<(FsWatcher, mpsc::UnboundedReceiver<PathEvent>)> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(PathBuf, SyncIntent)>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Filesystem watch error");
                return;
            }
        };
        for (path, intent) in classify(&event) {
            let _ = raw_tx.send((path, intent));
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(debounce_loop(raw_rx, out_tx));

    tracing::info!(root = %root.display(), "Watching sync root");
    Ok((FsWatcher { _watcher: watcher }, out_rx))
}

/// Map a raw notify event onto per-path intents.
///
/// Directories never sync; for removals (where the path can no longer be
/// inspected) the intent is Delete and the queue decides whether it knew the
/// path as a file.
fn classify(event: &Event) -> Vec<(PathBuf, SyncIntent)> {
    let mut intents = Vec::new();
    for path in &event.paths {
        let intent = match event.kind {
            EventKind::Create(_) => {
                if path.is_dir() {
                    continue;
                }
                SyncIntent::Create
            }
            EventKind::Modify(_) => {
                if path.is_dir() {
                    continue;
                }
                // Rename targets arrive as Modify; decide from the disk state.
                if path.exists() {
                    SyncIntent::Modify
                } else {
                    SyncIntent::Delete
                }
            }
            EventKind::Remove(_) => SyncIntent::Delete,
            _ => continue,
        };
        intents.push((path.clone(), intent));
    }
    intents
}

/// Fold a later intent into an earlier, not-yet-emitted one.
fn coalesce(earlier: SyncIntent, later: SyncIntent) -> SyncIntent {
    match (earlier, later) {
        // A brand-new file being written to is still a create.
        (SyncIntent::Create, SyncIntent::Modify) => SyncIntent::Create,
        // Deleted and re-created within the window: content replacement.
        (SyncIntent::Delete, SyncIntent::Create) => SyncIntent::Modify,
        (_, later) => later,
    }
}

async fn debounce_loop(
    mut raw_rx: mpsc::UnboundedReceiver<(PathBuf, SyncIntent)>,
    out_tx: mpsc::UnboundedSender<PathEvent>,
) {
    let mut pending: HashMap<PathBuf, (SyncIntent, Instant)> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, deadline)| *deadline).min();

        tokio::select! {
            raw = raw_rx.recv() => {
                match raw {
                    Some((path, intent)) => {
                        let deadline = Instant::now() + DEBOUNCE_WINDOW;
                        pending
                            .entry(path)
                            .and_modify(|slot| {
                                slot.0 = coalesce(slot.0, intent);
                                slot.1 = deadline;
                            })
                            .or_insert((intent, deadline));
                    }
                    None => {
                        for (path, (intent, _)) in pending.drain() {
                            let _ = out_tx.send(PathEvent { path, intent });
                        }
                        return;
                    }
                }
            }

            _ = wait_until(next_deadline) => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    if let Some((intent, _)) = pending.remove(&path) {
                        if out_tx.send(PathEvent { path, intent }).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Sleep until the deadline, or forever when there is nothing pending.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
