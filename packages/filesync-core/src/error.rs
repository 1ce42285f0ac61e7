//! Error types shared by the sync domain and the client engine.
//!
//! One enum, grouped by area. Server-side HTTP mapping lives in the server
//! crate; this type only distinguishes what the *client* needs to act on:
//! whether an operation can be retried, and whether a conflict needs to be
//! surfaced to the resolver instead of retried.

use thiserror::Error;

/// Result type alias for filesync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sync operations
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Chunking & integrity
    // ========================================================================
    /// A chunk sequence failed validation (gap, checksum, disagreeing totals)
    #[error("chunk integrity error: {0}")]
    ChunkIntegrity(String),

    /// Assembled bytes do not match the expected size or checksum
    #[error("assembled file failed verification: {0}")]
    AssemblyFailed(String),

    // ========================================================================
    // Local filesystem & state
    // ========================================================================
    /// Failed to read or write a local file
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted client state file is unreadable
    #[error("client state corrupted: {0}")]
    StateCorrupted(String),

    /// Filesystem watcher error
    #[error("watcher error: {0}")]
    Watch(String),

    /// A path escapes the sync root or cannot be normalized
    #[error("invalid sync path: {0}")]
    InvalidPath(String),

    // ========================================================================
    // Configuration
    // ========================================================================
    /// Malformed or unusable client configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Server communication
    // ========================================================================
    /// HTTP transport failure (connection refused, DNS, timeout)
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected the request (4xx other than auth/conflict)
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The server failed (5xx); retriable
    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// Authentication is missing, expired, or refused
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Event socket failure
    #[error("event transport error: {0}")]
    Transport(String),

    /// The requested file, version, or session does not exist on the server
    #[error("not found: {0}")]
    NotFound(String),

    /// The upload session expired before completion
    #[error("upload session expired: {0}")]
    SessionExpired(String),

    // ========================================================================
    // Sync semantics
    // ========================================================================
    /// The server detected a concurrent edit; the resolver must decide
    #[error("conflict on {path} (conflict version {conflict_version_id})")]
    Conflict {
        path: String,
        conflict_version_id: String,
    },

    /// The server holds a newer version; download before re-submitting
    #[error("client copy of {0} is stale")]
    ClientShouldUpdate(String),

    // ========================================================================
    // Serialization
    // ========================================================================
    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the operation can be retried with backoff.
    ///
    /// Conflicts are deliberately *not* retriable: they go to the resolver.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::ServerError { .. } | Error::Transport(_)
        )
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watch(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
