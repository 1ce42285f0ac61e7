//! HTTP error mapping.
//!
//! Core services surface typed errors; this module translates them at the
//! controller boundary. Note what is *not* here: a sync conflict travels as
//! a structured outcome in a 200 body, because the client reconciles it
//! rather than treating it as a failure.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result alias for handler and service code.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error taxonomy, one variant per HTTP outcome.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Bad input: malformed body, unknown chunk index, size mismatch → 400
    #[error("{0}")]
    Validation(String),

    /// Unknown file, session, version, or user → 404
    #[error("{0}")]
    NotFound(String),

    /// Unsatisfiable `Range` header → 416 with `Content-Range: bytes */size`
    #[error("range not satisfiable for file of {file_size} bytes")]
    RangeNotSatisfiable { file_size: u64 },

    /// Chunk or assembled-file checksum mismatch → 422
    #[error("{0}")]
    Integrity(String),

    /// Missing or invalid credentials → 401
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated but not allowed → 403
    #[error("{0}")]
    Forbidden(String),

    /// The upload session's TTL elapsed → 410
    #[error("{0}")]
    SessionExpired(String),

    /// The user's storage quota would be exceeded → 507
    #[error("{0}")]
    QuotaExceeded(String),

    /// Per-file lock could not be acquired within the bound → 503
    #[error("file is busy: {0}")]
    Busy(String),

    /// Filesystem failure; the operation was rolled back → 500
    #[error("storage error: {0}")]
    Storage(String),

    /// Database failure; the operation was rolled back → 500
    #[error("database error: {0}")]
    Database(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::SessionExpired(_) => StatusCode::GONE,
            ApiError::QuotaExceeded(_) => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Storage(_) | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        let mut response =
            (status, Json(json!({ "message": self.to_string() }))).into_response();

        if let ApiError::RangeNotSatisfiable { file_size } = self {
            let value = format!("bytes */{}", file_size);
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Database(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Validation(format!("malformed JSON: {}", err))
    }
}

impl From<filesync_core::Error> for ApiError {
    fn from(err: filesync_core::Error) -> Self {
        use filesync_core::Error as CoreError;
        match err {
            CoreError::ChunkIntegrity(msg) | CoreError::AssemblyFailed(msg) => {
                ApiError::Integrity(msg)
            }
            CoreError::NotFound(msg) => ApiError::NotFound(msg),
            CoreError::SessionExpired(msg) => ApiError::SessionExpired(msg),
            other => ApiError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::RangeNotSatisfiable { file_size: 10 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            ApiError::Integrity("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::SessionExpired("x".into()).status(),
            StatusCode::GONE
        );
        assert_eq!(
            ApiError::QuotaExceeded("x".into()).status(),
            StatusCode::INSUFFICIENT_STORAGE
        );
    }

    #[test]
    fn test_range_error_carries_content_range_header() {
        let response = ApiError::RangeNotSatisfiable { file_size: 1_048_576 }.into_response();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            response.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1048576"
        );
    }

    #[test]
    fn test_core_error_conversion() {
        let err: ApiError = filesync_core::Error::ChunkIntegrity("bad chunk".into()).into();
        assert!(matches!(err, ApiError::Integrity(_)));

        let err: ApiError = filesync_core::Error::NotFound("file-1".into()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
