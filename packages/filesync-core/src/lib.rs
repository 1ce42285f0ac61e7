//! # Filesync Core
//!
//! Shared synchronization domain and client-side engine for the filesync
//! service. The server crate reuses the domain half (version vectors,
//! chunking, wire protocol); the client binary wires the engine half
//! (watcher, upload queue, event transport, conflict resolution) into a
//! running daemon.
//!
//! ## Quick start (client side)
//!
//! ```rust,ignore
//! use filesync_core::config::ClientConfig;
//! use filesync_core::api::SyncApi;
//!
//! #[tokio::main]
//! async fn main() -> filesync_core::Result<()> {
//!     let mut config = ClientConfig::load_default()?;
//!     let api = SyncApi::new(&config.server_url);
//!     api.login("alice", "hunter2").await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod chunking;
pub mod client_id;
pub mod config;
pub mod conflict;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod reconcile;
pub mod transport;
pub mod version_vector;
pub mod watcher;

// Re-export commonly used types
pub use chunking::FileChunk;
pub use error::{Error, Result};
pub use protocol::{ConflictStatus, SyncEventDto, SyncEventType, SyncStatus};
pub use version_vector::VersionVector;
