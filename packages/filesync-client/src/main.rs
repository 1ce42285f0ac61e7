//! Filesync client daemon.
//!
//! Watches the configured sync folder, pushes local changes through the
//! server's sync endpoint, applies peer changes delivered over the event
//! socket, and runs a periodic reconciliation pass to catch anything the
//! live paths missed. Conflicts pause on disk until resolved with the
//! `resolve` subcommand.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use filesync_core::api::SyncApi;
use filesync_core::config::ClientConfig;
use filesync_core::conflict::{self, ResolutionChoice};
use filesync_core::queue::{LocalStore, SyncClient};
use filesync_core::reconcile;
use filesync_core::transport::EventTransport;
use filesync_core::watcher;

/// Workers draining the upload queue.
const UPLOAD_WORKERS: usize = 4;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "filesync", version, about = "Filesync client")]
struct Cli {
    /// Path to the client.properties config file
    #[arg(long, default_value = "client.properties", env = "FILESYNC_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account on the configured server
    Register {
        username: String,
        email: String,
        #[arg(long, env = "FILESYNC_PASSWORD")]
        password: String,
    },

    /// Log in and persist tokens into the config file
    Login {
        username: String,
        #[arg(long, env = "FILESYNC_PASSWORD")]
        password: String,
    },

    /// Run the sync daemon (watcher + event socket + reconciliation)
    Run,

    /// Show local sync state: files, tombstones, pending conflicts
    Status,

    /// Resolve a pending conflict on a path
    Resolve {
        /// Forward-slash path relative to the sync root
        path: String,
        /// Keep the local copy and push it to the server
        #[arg(long, conflicts_with_all = ["use_server", "merged_file"])]
        use_local: bool,
        /// Take the server's copy and overwrite the local file
        #[arg(long, conflicts_with_all = ["use_local", "merged_file"])]
        use_server: bool,
        /// Submit the given file as the hand-merged result
        #[arg(long, conflicts_with_all = ["use_local", "use_server"])]
        merged_file: Option<PathBuf>,
    },

    /// Copy a file from outside the sync root into it and upload it
    Import { source: PathBuf },
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "filesync=info,filesync_core=info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> filesync_core::Result<()> {
    let mut config = ClientConfig::load(&cli.config)?;

    match cli.command {
        Command::Register {
            username,
            email,
            password,
        } => {
            let api = SyncApi::new(&config.server_url);
            api.register(&username, &email, &password).await?;
            println!("Account '{}' registered.", username);
            Ok(())
        }

        Command::Login { username, password } => {
            let api = SyncApi::new(&config.server_url);
            let tokens = api.login(&username, &password).await?;

            config.username = Some(username.clone());
            config.auth_token = Some(tokens.access_token);
            config.refresh_token = Some(tokens.refresh_token);
            let client_id = config.effective_client_id();
            config.save(&cli.config)?;

            println!("Logged in as '{}' (client id {}).", username, client_id);
            Ok(())
        }

        Command::Run => run_daemon(&cli.config, config).await,

        Command::Status => {
            let store = LocalStore::load(&state_path(&cli.config))?;
            println!("Tracked files: {}", store.known_paths().len());

            let tombstones = store.tombstones();
            println!("Tombstones: {}", tombstones.len());
            for (path, deleted_at) in &tombstones {
                println!("  {} (deleted {})", path, deleted_at.to_rfc3339());
            }

            let conflicts = store.conflicts();
            println!("Pending conflicts: {}", conflicts.len());
            for conflict in &conflicts {
                println!(
                    "  {} (detected {})",
                    conflict.file_path,
                    conflict.detected_at.to_rfc3339()
                );
            }
            Ok(())
        }

        Command::Resolve {
            path,
            use_local,
            use_server,
            merged_file,
        } => {
            let (client, _api) = build_engine(&cli.config, &mut config).await?;

            if client.store().conflict(&path).is_none() {
                println!("No pending conflict on '{}'.", path);
                return Ok(());
            }

            let choice = if use_local {
                ResolutionChoice::UseLocal
            } else if use_server {
                ResolutionChoice::UseServer
            } else if let Some(merged_path) = merged_file {
                ResolutionChoice::UseMerged(tokio::fs::read(&merged_path).await?)
            } else {
                // No choice given: print the merge seed for text files so
                // the user can edit it and come back with --merged-file.
                let abs = client.root().join(&path);
                let size = tokio::fs::metadata(&abs).await.map(|m| m.len()).unwrap_or(0);
                if conflict::is_mergeable_text(Path::new(&path), size) {
                    println!("{}", client.merge_seed_for(&path).await?);
                } else {
                    println!(
                        "'{}' is not mergeable text; pass --use-local or --use-server.",
                        path
                    );
                }
                return Ok(());
            };

            client.resolve_conflict(&path, choice).await?;
            println!("Conflict on '{}' resolved.", path);
            Ok(())
        }

        Command::Import { source } => {
            let (client, _api) = build_engine(&cli.config, &mut config).await?;
            let rel = client.import_external(&source).await?;
            println!("Imported '{}' as '{}'.", source.display(), rel);
            // Give the queue worker a moment to push the create
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        }
    }
}

// ── Daemon ────────────────────────────────────────────────────────────────────

async fn run_daemon(config_path: &Path, mut config: ClientConfig) -> filesync_core::Result<()> {
    let (client, api) = build_engine(config_path, &mut config).await?;

    let token = api.token().ok_or_else(|| {
        filesync_core::Error::Auth("no auth token in config; run 'filesync login' first".into())
    })?;
    let client_id = client.client_id().to_string();

    // ── Event socket ──────────────────────────────────────────────────────

    let (transport, mut events_rx) = EventTransport::spawn(
        config.ws_url(),
        token,
        client_id.clone(),
        Arc::new(|connected| {
            if connected {
                tracing::info!("Event socket online");
            } else {
                tracing::warn!("Event socket offline, will reconnect");
            }
        }),
    );

    let event_client = client.clone();
    tokio::spawn(async move {
        while let Some(incoming) = events_rx.recv().await {
            if let Err(e) = event_client.apply_remote_event(incoming).await {
                tracing::warn!(error = %e, "Failed to apply remote event");
            }
        }
    });

    // ── Catch-up on events missed while offline ──────────────────────────

    if let Some(since) = client.store().last_event_at() {
        match api.events_since(since).await {
            Ok(missed) if !missed.is_empty() => {
                tracing::info!(count = missed.len(), "Replaying missed events");
                for event in missed {
                    let incoming = match event.event_type {
                        filesync_core::SyncEventType::Conflict => {
                            filesync_core::transport::IncomingEvent::Conflict(event)
                        }
                        _ => filesync_core::transport::IncomingEvent::FileChange(event),
                    };
                    if let Err(e) = client.apply_remote_event(incoming).await {
                        tracing::warn!(error = %e, "Failed to replay event");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Event catch-up failed"),
        }
    }

    // ── Watcher ───────────────────────────────────────────────────────────

    let (_fs_watcher, mut path_events) = watcher::watch(client.root())?;
    let watch_client = client.clone();
    tokio::spawn(async move {
        while let Some(event) = path_events.recv().await {
            watch_client.handle_path_event(event).await;
        }
    });

    // ── Periodic reconciliation ───────────────────────────────────────────

    let reconcile_client = client.clone();
    let interval_secs = config.sync_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            if let Err(e) = reconcile::reconcile_once(&reconcile_client).await {
                tracing::warn!(error = %e, "Reconciliation pass failed");
            }
        }
    });

    tracing::info!(
        root = %client.root().display(),
        client_id = client_id.as_str(),
        "Sync daemon running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    transport.shutdown();
    client.store().save()?;
    Ok(())
}

// ── Wiring ────────────────────────────────────────────────────────────────────

/// Build the sync engine shared by the daemon and the one-shot commands.
async fn build_engine(
    config_path: &Path,
    config: &mut ClientConfig,
) -> filesync_core::Result<(Arc<SyncClient>, Arc<SyncApi>)> {
    let api = Arc::new(SyncApi::new(&config.server_url));
    api.set_token(config.auth_token.clone());

    // A stored refresh token gets us fresh credentials for this run.
    if let Some(refresh_token) = config.refresh_token.clone() {
        match api.refresh(&refresh_token).await {
            Ok(tokens) => {
                config.auth_token = Some(tokens.access_token);
                config.refresh_token = Some(tokens.refresh_token);
                config.save(config_path)?;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Token refresh failed, using stored token");
            }
        }
    }

    let client_id = config.effective_client_id();
    config.save(config_path)?;

    tokio::fs::create_dir_all(&config.sync_path).await?;
    let store = Arc::new(LocalStore::load(&state_path(config_path))?);

    let client = SyncClient::spawn(
        api.clone(),
        store,
        config.sync_path.clone(),
        client_id,
        UPLOAD_WORKERS,
    );
    Ok((client, api))
}

/// The local sync-state file sits beside the config file.
fn state_path(config_path: &Path) -> PathBuf {
    config_path.with_extension("state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_path_sits_beside_config() {
        assert_eq!(
            state_path(Path::new("client.properties")),
            PathBuf::from("client.state.json")
        );
        assert_eq!(
            state_path(Path::new("/etc/filesync/client.properties")),
            PathBuf::from("/etc/filesync/client.state.json")
        );
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["filesync", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, PathBuf::from("client.properties"));
    }

    #[test]
    fn test_cli_parses_resolve_flags() {
        let cli = Cli::parse_from(["filesync", "resolve", "docs/a.txt", "--use-local"]);
        match cli.command {
            Command::Resolve {
                path, use_local, ..
            } => {
                assert_eq!(path, "docs/a.txt");
                assert!(use_local);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
