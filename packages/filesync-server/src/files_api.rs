//! File REST endpoints: listing, direct upload/update, delete, version
//! history, metadata, and the event catch-up feed.

use std::collections::HashMap;

use axum::extract::{Multipart, Path, Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, TimeZone, Utc};

use filesync_core::chunking::sha256_hex;
use filesync_core::protocol::{
    DeleteRequest, FileDto, FileMetadataDto, FileVersionDto, SyncEventDto, SyncResponseDto,
};
use filesync_core::VersionVector;

use crate::auth::AuthUser;
use crate::dto::{event_to_dto, file_to_dto, metadata_to_dto, outcome_to_response, version_to_dto};
use crate::engine::SyncSubmission;
use crate::error::{ApiError, ApiResult};
use crate::repository::FileRecord;
use crate::state::AppState;

/// GET /api/files/
pub async fn list_files(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<FileDto>>> {
    let files = state.repo.list_files(&user.user_id)?;
    Ok(Json(files.iter().map(file_to_dto).collect()))
}

/// POST /api/files/upload: direct (non-chunked) upload of a new file.
///
/// Multipart fields: `file` (bytes), `path`, `client_id`,
/// `version_vector` (JSON).
pub async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    multipart: Multipart,
) -> ApiResult<Json<SyncResponseDto>> {
    let form = parse_sync_form(multipart).await?;
    let file_path = form
        .path
        .ok_or_else(|| ApiError::Validation("missing 'path' field".into()))?;

    submit(&state, &user, file_path, form.bytes, form.client_id, form.vector).await
}

/// PUT /api/files/{file_id}: update an existing file.
pub async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<Json<SyncResponseDto>> {
    let file = owned_file(&state, &user, &file_id)?;
    let form = parse_sync_form(multipart).await?;

    submit(
        &state,
        &user,
        file.file_path,
        form.bytes,
        form.client_id,
        form.vector,
    )
    .await
}

async fn submit(
    state: &AppState,
    user: &AuthUser,
    file_path: String,
    bytes: Option<Vec<u8>>,
    client_id: Option<String>,
    vector: Option<VersionVector>,
) -> ApiResult<Json<SyncResponseDto>> {
    let bytes = bytes.ok_or_else(|| ApiError::Validation("missing 'file' field".into()))?;
    let client_id =
        client_id.ok_or_else(|| ApiError::Validation("missing 'client_id' field".into()))?;
    let vector =
        vector.ok_or_else(|| ApiError::Validation("missing 'version_vector' field".into()))?;

    let checksum = sha256_hex(&bytes);
    let outcome = state
        .engine
        .sync_file(SyncSubmission {
            user_id: user.user_id.clone(),
            file_path: file_path.clone(),
            client_id,
            client_vector: vector,
            checksum,
            bytes,
        })
        .await?;

    Ok(Json(outcome_to_response(&outcome, &file_path)))
}

/// DELETE /api/files/{file_id}: tombstone a file.
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
    Json(request): Json<DeleteRequest>,
) -> ApiResult<Json<SyncResponseDto>> {
    let file = owned_file(&state, &user, &file_id)?;
    let outcome = state
        .engine
        .delete_file(
            &user.user_id,
            &file_id,
            &request.client_id,
            &request.version_vector,
        )
        .await?;

    Ok(Json(outcome_to_response(&outcome, &file.file_path)))
}

/// GET /api/files/{file_id}/versions: full version history, conflict
/// versions included.
pub async fn versions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<Vec<FileVersionDto>>> {
    owned_file(&state, &user, &file_id)?;
    let versions = state.repo.list_versions(&file_id)?;
    Ok(Json(versions.iter().map(version_to_dto).collect()))
}

/// GET /api/files/{file_id}/metadata: download planning info.
pub async fn metadata(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<FileMetadataDto>> {
    let file = owned_file(&state, &user, &file_id)?;
    Ok(Json(metadata_to_dto(&file)))
}

/// GET /api/files/events?since=<rfc3339>: the caller's sync events since a
/// timestamp, ascending. Backs client catch-up after a socket outage.
pub async fn events_since(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<SyncEventDto>>> {
    let since = match params.get("since") {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| ApiError::Validation(format!("bad 'since' timestamp: {}", e)))?
            .with_timezone(&Utc),
        None => Utc.timestamp_millis_opt(0).single().unwrap_or_else(Utc::now),
    };

    let events = state.repo.sync_events_since(&user.user_id, since)?;
    Ok(Json(events.iter().map(event_to_dto).collect()))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Look up a file and verify ownership.
pub fn owned_file(state: &AppState, user: &AuthUser, file_id: &str) -> ApiResult<FileRecord> {
    let file = state
        .repo
        .find_file_by_id(file_id)?
        .ok_or_else(|| ApiError::NotFound(format!("file {} does not exist", file_id)))?;
    if file.user_id != user.user_id {
        return Err(ApiError::Forbidden("file belongs to another user".into()));
    }
    Ok(file)
}

struct SyncForm {
    bytes: Option<Vec<u8>>,
    path: Option<String>,
    client_id: Option<String>,
    vector: Option<VersionVector>,
}

async fn parse_sync_form(mut multipart: Multipart) -> ApiResult<SyncForm> {
    let mut form = SyncForm {
        bytes: None,
        path: None,
        client_id: None,
        vector: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("failed to read file field: {}", e)))?;
                form.bytes = Some(data.to_vec());
            }
            "path" => {
                form.path = Some(read_text(field).await?);
            }
            "client_id" => {
                form.client_id = Some(read_text(field).await?);
            }
            "version_vector" => {
                let raw = read_text(field).await?;
                form.vector = Some(serde_json::from_str(&raw).map_err(|e| {
                    ApiError::Validation(format!("bad version_vector JSON: {}", e))
                })?);
            }
            _ => {} // unknown fields are ignored
        }
    }

    Ok(form)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read form field: {}", e)))
}
