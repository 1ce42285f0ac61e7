//! Chunked upload REST surface.
//!
//! Thin handlers over the session manager. The chunk that completes a
//! session triggers the decision engine inline and the resulting sync
//! outcome rides back in the same response.

use axum::extract::{Multipart, Path, State};
use axum::{Extension, Json};

use filesync_core::protocol::{ChunkReceiptDto, InitiateUploadRequest, UploadSessionDto};

use crate::auth::AuthUser;
use crate::dto::outcome_to_response;
use crate::engine::SyncSubmission;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/files/upload/initiate-chunked
pub async fn initiate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(mut request): Json<InitiateUploadRequest>,
) -> ApiResult<Json<UploadSessionDto>> {
    // Quota is re-checked at assembly; failing early spares the transfer.
    if let Some(account) = state.repo.find_user_by_id(&user.user_id)? {
        if account.used_storage + request.total_file_size > account.storage_quota {
            return Err(ApiError::QuotaExceeded(format!(
                "storing {} bytes would exceed the {} byte quota",
                request.total_file_size, account.storage_quota
            )));
        }
    }

    // An upload for a known path continues that file's identity.
    if request.file_id.is_none() {
        if let Some(existing) = state
            .repo
            .find_file_by_path(&user.user_id, &request.file_path)?
        {
            request.file_id = Some(existing.id);
        }
    }

    let session = state.sessions.initiate(&user.user_id, &request)?;
    Ok(Json(session))
}

/// POST /api/files/upload/chunk
///
/// Multipart fields: `session_id`, `chunk_index`, `chunk_data`, and an
/// optional `chunk_checksum` verified before the chunk is accepted.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<Json<ChunkReceiptDto>> {
    let mut session_id: Option<String> = None;
    let mut chunk_index: Option<u32> = None;
    let mut chunk_checksum: Option<String> = None;
    let mut chunk_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "session_id" => {
                session_id = Some(text(field).await?);
            }
            "chunk_index" => {
                let raw = text(field).await?;
                chunk_index = Some(raw.parse().map_err(|_| {
                    ApiError::Validation(format!("chunk_index is not a number: '{}'", raw))
                })?);
            }
            "chunk_checksum" => {
                chunk_checksum = Some(text(field).await?);
            }
            "chunk_data" => {
                let data = field.bytes().await.map_err(|e| {
                    ApiError::Validation(format!("failed to read chunk data: {}", e))
                })?;
                chunk_data = Some(data.to_vec());
            }
            _ => {}
        }
    }

    let session_id =
        session_id.ok_or_else(|| ApiError::Validation("missing 'session_id' field".into()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| ApiError::Validation("missing 'chunk_index' field".into()))?;
    let chunk_data =
        chunk_data.ok_or_else(|| ApiError::Validation("missing 'chunk_data' field".into()))?;

    let (session, assembled) = state.sessions.receive_chunk(
        &user.user_id,
        &session_id,
        chunk_index,
        &chunk_data,
        chunk_checksum.as_deref(),
    )?;

    // The completing chunk hands the assembled bytes to the sync engine.
    let sync_result = match assembled {
        Some(upload) => {
            let file_path = upload.file_path.clone();
            let outcome = state
                .engine
                .sync_file(SyncSubmission {
                    user_id: upload.user_id,
                    file_path: upload.file_path,
                    client_id: upload.client_id,
                    client_vector: upload.version_vector,
                    checksum: upload.checksum,
                    bytes: upload.bytes,
                })
                .await?;
            Some(outcome_to_response(&outcome, &file_path))
        }
        None => None,
    };

    Ok(Json(ChunkReceiptDto {
        session,
        sync_result,
    }))
}

/// GET /api/files/upload/status/{session_id}
pub async fn status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<UploadSessionDto>> {
    Ok(Json(state.sessions.status(&user.user_id, &session_id)?))
}

/// DELETE /api/files/upload/cancel/{session_id}
pub async fn cancel(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<UploadSessionDto>> {
    Ok(Json(state.sessions.cancel(&user.user_id, &session_id)?))
}

/// GET /api/files/upload/sessions
pub async fn sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<UploadSessionDto>>> {
    Ok(Json(state.sessions.active_sessions(&user.user_id)))
}

async fn text(field: axum::extract::multipart::Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read form field: {}", e)))
}
