//! Wire protocol shared by the server and its clients.
//!
//! REST payloads and event-socket frames are plain JSON with snake_case
//! field names; enum values travel in SCREAMING_SNAKE_CASE. The server and
//! client crates both deserialize from this module, so the two sides cannot
//! drift apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version_vector::VersionVector;

// ── Destinations ──────────────────────────────────────────────────────────────

/// Per-user queue carrying CREATE / MODIFY / DELETE events.
pub const FILE_CHANGES_DESTINATION: &str = "/user/queue/file-changes";

/// Per-user queue carrying CONFLICT events.
pub const CONFLICTS_DESTINATION: &str = "/user/queue/conflicts";

/// Application endpoint heartbeats are addressed to.
pub const HEARTBEAT_DESTINATION: &str = "/app/heartbeat";

// ── Enums ─────────────────────────────────────────────────────────────────────

/// Kind of a sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventType {
    Create,
    Modify,
    Delete,
    Conflict,
    Heartbeat,
    HeartbeatAck,
}

/// Sync state of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Deleted,
    Error,
}

/// Whether a file has an unresolved concurrent edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    None,
    Conflict,
}

/// Processing state of a recorded sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Completed,
    Failed,
}

/// Lifecycle state of a chunk upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

// ── Event DTO ─────────────────────────────────────────────────────────────────

/// A sync event as it travels over the socket and the events endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventDto {
    pub event_id: String,
    pub event_type: SyncEventType,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    pub client_id: String,
    pub timestamp: DateTime<Utc>,
    pub sync_status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_vector: Option<VersionVector>,
}

// ── File DTOs ─────────────────────────────────────────────────────────────────

/// A file as reported by `GET /api/files/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDto {
    pub file_id: String,
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

/// One row of a file's version history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersionDto {
    pub version_id: String,
    pub file_id: String,
    pub version_number: i64,
    pub checksum: String,
    pub file_size: u64,
    pub version_vector: VersionVector,
    pub created_by_client: String,
    pub is_current_version: bool,
    pub created_at: DateTime<Utc>,
}

/// Download-planning metadata for a single file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadataDto {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub checksum: String,
    pub supports_range_requests: bool,
}

// ── Sync results ──────────────────────────────────────────────────────────────

/// Outcome of a sync submission.
///
/// A conflict is a normal, reconcilable outcome and travels in a 200
/// response body, not as a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncResponseDto {
    Success {
        file: FileDto,
    },
    Conflict {
        conflict_version_id: String,
        file_path: String,
    },
    ClientShouldUpdate {
        file_path: String,
    },
    Error {
        message: String,
    },
}

/// Body of `DELETE /api/files/{file_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub client_id: String,
    pub version_vector: VersionVector,
}

// ── Chunk upload DTOs ─────────────────────────────────────────────────────────

/// Body of `POST /api/files/upload/initiate-chunked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub file_path: String,
    pub total_chunks: u32,
    pub total_file_size: u64,
    /// Whole-file SHA-256, verified after assembly when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub client_id: String,
    pub version_vector: VersionVector,
}

/// Snapshot of a chunk upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSessionDto {
    pub session_id: String,
    pub file_id: String,
    pub file_path: String,
    pub total_chunks: u32,
    pub received_chunks: u32,
    /// Per-index receipt flags, length `total_chunks`.
    pub received_bitset: Vec<bool>,
    pub total_file_size: u64,
    pub received_size: u64,
    /// `received_chunks / total_chunks` in `[0, 1]`.
    pub progress: f64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Response to a chunk upload. `sync_result` is present only on the request
/// that completed the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReceiptDto {
    pub session: UploadSessionDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_result: Option<SyncResponseDto>,
}

// ── Auth DTOs ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub user_id: String,
}

// ── Socket Frames ─────────────────────────────────────────────────────────────

/// Frames sent from a client to the event socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a per-user destination.
    Subscribe { id: String, destination: String },

    /// Drop a subscription.
    Unsubscribe { id: String },

    /// Keepalive; carries the sender's real client id.
    Heartbeat { client_id: String },
}

/// Frames sent from the event socket to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Acknowledgement of a subscription.
    Subscribed { id: String, destination: String },

    /// A sync event delivered to one of the subscribed destinations.
    Event {
        destination: String,
        event: SyncEventDto,
    },

    /// Reply to a heartbeat.
    HeartbeatAck,

    /// Protocol-level error.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_dto_uses_snake_case_wire_names() {
        let dto = SyncEventDto {
            event_id: "evt-1".to_string(),
            event_type: SyncEventType::Create,
            user_id: "user-1".to_string(),
            file_id: Some("file-1".to_string()),
            file_path: Some("docs/readme.md".to_string()),
            checksum: Some("abc".to_string()),
            file_size: Some(13),
            client_id: "client-a".to_string(),
            timestamp: Utc::now(),
            sync_status: EventStatus::Completed,
            version_vector: None,
        };
        let json = serde_json::to_string(&dto).unwrap();

        assert!(json.contains("\"event_id\""));
        assert!(json.contains("\"event_type\":\"CREATE\""));
        assert!(json.contains("\"file_path\""));
        assert!(json.contains("\"sync_status\":\"COMPLETED\""));
        // Absent optionals are omitted, not null
        assert!(!json.contains("version_vector"));
    }

    #[test]
    fn test_sync_response_is_tagged_by_status() {
        let conflict = SyncResponseDto::Conflict {
            conflict_version_id: "ver-9".to_string(),
            file_path: "a.txt".to_string(),
        };
        let json = serde_json::to_string(&conflict).unwrap();
        assert!(json.contains("\"status\":\"CONFLICT\""));
        assert!(json.contains("\"conflict_version_id\":\"ver-9\""));

        let parsed: SyncResponseDto = serde_json::from_str(&json).unwrap();
        match parsed {
            SyncResponseDto::Conflict {
                conflict_version_id,
                ..
            } => assert_eq!(conflict_version_id, "ver-9"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_frame_round_trip() {
        let frames = vec![
            ClientFrame::Subscribe {
                id: "sub-1".to_string(),
                destination: FILE_CHANGES_DESTINATION.to_string(),
            },
            ClientFrame::Unsubscribe {
                id: "sub-1".to_string(),
            },
            ClientFrame::Heartbeat {
                client_id: "client-a".to_string(),
            },
        ];

        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let parsed: ClientFrame = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }

    #[test]
    fn test_server_frame_tags() {
        let json = serde_json::to_string(&ServerFrame::HeartbeatAck).unwrap();
        assert!(json.contains("\"type\":\"heartbeat_ack\""));

        let sub = ServerFrame::Subscribed {
            id: "sub-1".to_string(),
            destination: CONFLICTS_DESTINATION.to_string(),
        };
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"type\":\"subscribed\""));
        assert!(json.contains("/user/queue/conflicts"));
    }

    #[test]
    fn test_token_response_field_names() {
        let resp = TokenResponse {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            user_id: "user-1".to_string(),
        };
        let json = serde_json::to_string(&resp).unwrap();
        for field in [
            "access_token",
            "refresh_token",
            "token_type",
            "expires_in",
            "user_id",
        ] {
            assert!(json.contains(field), "missing {}", field);
        }
    }

    #[test]
    fn test_session_dto_progress_serializes() {
        let dto = UploadSessionDto {
            session_id: "sess-1".to_string(),
            file_id: "file-1".to_string(),
            file_path: "big.bin".to_string(),
            total_chunks: 6,
            received_chunks: 5,
            received_bitset: vec![true, true, true, false, true, true],
            total_file_size: 30 * 1024 * 1024,
            received_size: 25 * 1024 * 1024,
            progress: 5.0 / 6.0,
            status: SessionStatus::InProgress,
            created_at: Utc::now(),
            completed_at: None,
            expires_at: Utc::now(),
            error_message: None,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"status\":\"IN_PROGRESS\""));
        assert!(json.contains("\"received_chunks\":5"));
        assert!(!json.contains("completed_at"));

        let parsed: UploadSessionDto = serde_json::from_str(&json).unwrap();
        assert!(!parsed.received_bitset[3]);
    }
}
