//! File downloads, whole and ranged.
//!
//! The chunked-download endpoint honors `Range: bytes=<start>-<end?>`
//! against the file's current version blob. Bodies stream straight off the
//! blob file handle; the handle lives inside the response stream and is
//! released when the body is dropped, including on client disconnect.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::files_api::owned_file;
use crate::state::AppState;

/// A validated inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a `Range` header value against a file size.
///
/// Grammar: `bytes=<start>-<end?>`. A missing end means end-of-file. Out of
/// bounds (`end >= file_size`), inverted (`start > end`), multi-range, and
/// malformed inputs are all unsatisfiable.
pub fn parse_range(header: &str, file_size: u64) -> Result<ByteRange, ()> {
    let suffix = header.strip_prefix("bytes=").ok_or(())?;
    if suffix.contains(',') {
        return Err(()); // multi-range unsupported
    }

    let (start_raw, end_raw) = suffix.split_once('-').ok_or(())?;
    let start: u64 = start_raw.trim().parse().map_err(|_| ())?;

    let end: u64 = if end_raw.trim().is_empty() {
        file_size.checked_sub(1).ok_or(())?
    } else {
        end_raw.trim().parse().map_err(|_| ())?
    };

    if start > end || end >= file_size {
        return Err(());
    }
    Ok(ByteRange { start, end })
}

/// GET /api/files/{file_id}/download: the whole file, status 200.
pub async fn download_full(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
) -> ApiResult<Response> {
    let file = owned_file(&state, &user, &file_id)?;
    let version = state
        .repo
        .current_version(&file_id)?
        .ok_or_else(|| ApiError::NotFound(format!("file {} has no current version", file_id)))?;

    let blob = state.blobs.open(&version.storage_path).await?;
    let stream = ReaderStream::new(blob);

    let mut headers = common_headers(&file.file_name)?;
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&version.file_size.to_string())
            .map_err(|_| ApiError::Storage("bad content length".into()))?,
    );

    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

/// GET /api/files/{file_id}/download-chunked: honors `Range`; without one
/// it behaves like a full download.
pub async fn download_chunked(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(file_id): Path<String>,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    let file = owned_file(&state, &user, &file_id)?;
    let version = state
        .repo
        .current_version(&file_id)?
        .ok_or_else(|| ApiError::NotFound(format!("file {} has no current version", file_id)))?;
    let file_size = version.file_size;

    let range_header = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let Some(raw_range) = range_header else {
        return download_full(
            State(state),
            Extension(user),
            Path(file_id),
        )
        .await;
    };

    let range = parse_range(raw_range, file_size)
        .map_err(|_| ApiError::RangeNotSatisfiable { file_size })?;

    let mut blob = state.blobs.open(&version.storage_path).await?;
    blob.seek(std::io::SeekFrom::Start(range.start))
        .await
        .map_err(|e| ApiError::Storage(format!("seek failed: {}", e)))?;
    let stream = ReaderStream::new(blob.take(range.length()));

    let mut headers = common_headers(&file.file_name)?;
    headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!(
            "bytes {}-{}/{}",
            range.start, range.end, file_size
        ))
        .map_err(|_| ApiError::Storage("bad content range".into()))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&range.length().to_string())
            .map_err(|_| ApiError::Storage("bad content length".into()))?,
    );

    tracing::debug!(
        file = file_id.as_str(),
        start = range.start,
        end = range.end,
        "Serving partial content"
    );
    Ok((StatusCode::PARTIAL_CONTENT, headers, Body::from_stream(stream)).into_response())
}

fn common_headers(file_name: &str) -> ApiResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    // Quotes stripped from the name keep the header parseable.
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file_name.replace(['"', '\\'], "_")
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| ApiError::Storage("bad content disposition".into()))?,
    );
    Ok(headers)
}
