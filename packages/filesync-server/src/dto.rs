//! Record → wire conversions.

use filesync_core::protocol::{
    FileDto, FileMetadataDto, FileVersionDto, SyncEventDto, SyncResponseDto,
};

use crate::engine::SyncOutcome;
use crate::repository::{FileRecord, FileVersionRecord, SyncEventRecord};

pub fn file_to_dto(record: &FileRecord) -> FileDto {
    FileDto {
        file_id: record.id.clone(),
        user_id: record.user_id.clone(),
        file_path: record.file_path.clone(),
        file_name: record.file_name.clone(),
        file_size: record.file_size,
        checksum: record.checksum.clone(),
        version_vector: record.version_vector.clone(),
        sync_status: record.sync_status,
        conflict_status: record.conflict_status,
        created_at: record.created_at,
        modified_at: record.modified_at,
    }
}

pub fn metadata_to_dto(record: &FileRecord) -> FileMetadataDto {
    FileMetadataDto {
        file_id: record.id.clone(),
        file_name: record.file_name.clone(),
        file_size: record.file_size,
        checksum: record.checksum.clone(),
        supports_range_requests: true,
    }
}

pub fn version_to_dto(record: &FileVersionRecord) -> FileVersionDto {
    FileVersionDto {
        version_id: record.id.clone(),
        file_id: record.file_id.clone(),
        version_number: record.version_number,
        checksum: record.checksum.clone(),
        file_size: record.file_size,
        version_vector: record.version_vector.clone(),
        created_by_client: record.created_by_client.clone(),
        is_current_version: record.is_current,
        created_at: record.created_at,
    }
}

pub fn event_to_dto(record: &SyncEventRecord) -> SyncEventDto {
    SyncEventDto {
        event_id: record.id.clone(),
        event_type: record.event_type,
        user_id: record.user_id.clone(),
        file_id: record.file_id.clone(),
        file_path: record.file_path.clone(),
        checksum: record.checksum.clone(),
        file_size: record.file_size,
        client_id: record.client_id.clone(),
        timestamp: record.timestamp,
        sync_status: record.sync_status,
        version_vector: record.version_vector.clone(),
    }
}

/// Shape a decision-engine outcome for the response body.
pub fn outcome_to_response(outcome: &SyncOutcome, file_path: &str) -> SyncResponseDto {
    match outcome {
        SyncOutcome::Success(file) => SyncResponseDto::Success {
            file: file_to_dto(file),
        },
        SyncOutcome::Conflict {
            conflict_version_id,
        } => SyncResponseDto::Conflict {
            conflict_version_id: conflict_version_id.clone(),
            file_path: file_path.to_string(),
        },
        SyncOutcome::ClientShouldUpdate => SyncResponseDto::ClientShouldUpdate {
            file_path: file_path.to_string(),
        },
    }
}
