//! REST client for the sync server.
//!
//! Thin, single-shot wrappers over the `/api` surface. Retry policy lives in
//! the upload queue; this layer only classifies failures (see
//! [`Error::is_retriable`]) and never retries on its own.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::chunking::FileChunk;
use crate::error::{Error, Result};
use crate::protocol::{
    ChunkReceiptDto, DeleteRequest, FileDto, FileMetadataDto, FileVersionDto,
    InitiateUploadRequest, LoginRequest, RefreshRequest, RegisterRequest, SyncEventDto,
    SyncResponseDto, TokenResponse, UploadSessionDto,
};
use crate::version_vector::VersionVector;

/// HTTP client for the sync server's REST API.
pub struct SyncApi {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl SyncApi {
    /// Create a client for a server base URL (e.g. `http://localhost:8080/api`).
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    /// Install a bearer token for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().expect("token lock") = token;
    }

    /// The currently installed bearer token, if any.
    pub fn token(&self) -> Option<String> {
        self.token.read().expect("token lock").clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    // ── Auth ──────────────────────────────────────────────────────────────

    /// Create an account.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        expect_success(resp).await?;
        Ok(())
    }

    /// Log in and install the returned access token.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let tokens: TokenResponse = parse_response(resp).await?;
        self.set_token(Some(tokens.access_token.clone()));
        Ok(tokens)
    }

    /// Exchange a refresh token for a new token pair and install it.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&RefreshRequest {
                refresh_token: refresh_token.to_string(),
            })
            .send()
            .await?;
        let tokens: TokenResponse = parse_response(resp).await?;
        self.set_token(Some(tokens.access_token.clone()));
        Ok(tokens)
    }

    /// Invalidate the server-side refresh token and drop the local one.
    pub async fn logout(&self) -> Result<()> {
        let resp = self
            .bearer(self.http.post(self.url("/auth/logout")))
            .send()
            .await?;
        expect_success(resp).await?;
        self.set_token(None);
        Ok(())
    }

    // ── Files ─────────────────────────────────────────────────────────────

    /// List the caller's files.
    pub async fn list_files(&self) -> Result<Vec<FileDto>> {
        let resp = self.bearer(self.http.get(self.url("/files/"))).send().await?;
        parse_response(resp).await
    }

    /// Direct (non-chunked) upload of a new or changed file.
    pub async fn upload_file(
        &self,
        file_path: &str,
        file_name: &str,
        bytes: Vec<u8>,
        client_id: &str,
        vector: &VersionVector,
    ) -> Result<SyncResponseDto> {
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
            .text("path", file_path.to_string())
            .text("client_id", client_id.to_string())
            .text("version_vector", serde_json::to_string(vector)?);

        let resp = self
            .bearer(self.http.post(self.url("/files/upload")))
            .multipart(form)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Update an existing file by id.
    pub async fn update_file(
        &self,
        file_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
        client_id: &str,
        vector: &VersionVector,
    ) -> Result<SyncResponseDto> {
        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.to_string()))
            .text("client_id", client_id.to_string())
            .text("version_vector", serde_json::to_string(vector)?);

        let resp = self
            .bearer(self.http.put(self.url(&format!("/files/{}", file_id))))
            .multipart(form)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Tombstone a file.
    pub async fn delete_file(
        &self,
        file_id: &str,
        client_id: &str,
        vector: &VersionVector,
    ) -> Result<SyncResponseDto> {
        let resp = self
            .bearer(self.http.delete(self.url(&format!("/files/{}", file_id))))
            .json(&DeleteRequest {
                client_id: client_id.to_string(),
                version_vector: vector.clone(),
            })
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Download a whole file.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url(&format!("/files/{}/download", file_id))),
            )
            .send()
            .await?;
        let resp = expect_success(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Download one byte range (inclusive bounds) of a file.
    pub async fn download_range(&self, file_id: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url(&format!("/files/{}/download-chunked", file_id)))
                    .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end)),
            )
            .send()
            .await?;
        let resp = expect_success(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Download a large file in bounded ranges and reassemble it.
    pub async fn download_in_ranges(
        &self,
        file_id: &str,
        file_size: u64,
        range_size: u64,
    ) -> Result<Vec<u8>> {
        let mut assembled = Vec::with_capacity(file_size as usize);
        let mut offset = 0u64;
        while offset < file_size {
            let end = (offset + range_size - 1).min(file_size - 1);
            let part = self.download_range(file_id, offset, end).await?;
            assembled.extend_from_slice(&part);
            offset = end + 1;
        }
        Ok(assembled)
    }

    /// Download-planning metadata.
    pub async fn metadata(&self, file_id: &str) -> Result<FileMetadataDto> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url(&format!("/files/{}/metadata", file_id))),
            )
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Version history for a file.
    pub async fn versions(&self, file_id: &str) -> Result<Vec<FileVersionDto>> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url(&format!("/files/{}/versions", file_id))),
            )
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Events recorded for the caller since a timestamp, ascending.
    pub async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<SyncEventDto>> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url("/files/events"))
                    .query(&[("since", since.to_rfc3339())]),
            )
            .send()
            .await?;
        parse_response(resp).await
    }

    // ── Chunk upload sessions ─────────────────────────────────────────────

    /// Open a chunk upload session.
    pub async fn initiate_chunked(
        &self,
        request: &InitiateUploadRequest,
    ) -> Result<UploadSessionDto> {
        let resp = self
            .bearer(self.http.post(self.url("/files/upload/initiate-chunked")))
            .json(request)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Upload one chunk into a session.
    pub async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &FileChunk,
    ) -> Result<ChunkReceiptDto> {
        let form = Form::new()
            .text("session_id", session_id.to_string())
            .text("chunk_index", chunk.chunk_index.to_string())
            .text("chunk_checksum", chunk.chunk_checksum.clone())
            .part(
                "chunk_data",
                Part::bytes(chunk.chunk_data.clone())
                    .file_name(format!("chunk-{}", chunk.chunk_index)),
            );

        let resp = self
            .bearer(self.http.post(self.url("/files/upload/chunk")))
            .multipart(form)
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Snapshot of a session.
    pub async fn session_status(&self, session_id: &str) -> Result<UploadSessionDto> {
        let resp = self
            .bearer(
                self.http
                    .get(self.url(&format!("/files/upload/status/{}", session_id))),
            )
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Cancel an in-progress session.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let resp = self
            .bearer(
                self.http
                    .delete(self.url(&format!("/files/upload/cancel/{}", session_id))),
            )
            .send()
            .await?;
        expect_success(resp).await?;
        Ok(())
    }

    /// The caller's active sessions.
    pub async fn active_sessions(&self) -> Result<Vec<UploadSessionDto>> {
        let resp = self
            .bearer(self.http.get(self.url("/files/upload/sessions")))
            .send()
            .await?;
        parse_response(resp).await
    }
}

// ── Response handling ─────────────────────────────────────────────────────────

async fn parse_response<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = expect_success(resp).await?;
    Ok(resp.json::<T>().await?)
}

/// Map HTTP failure statuses onto the error taxonomy.
async fn expect_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let message = body_message(resp).await;
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::GONE => Error::SessionExpired(message),
        s if s.is_server_error() => Error::ServerError {
            status: s.as_u16(),
            message,
        },
        s => Error::Rejected {
            status: s.as_u16(),
            message,
        },
    })
}

/// Best-effort extraction of `{"message": ...}` from an error body.
async fn body_message(resp: Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    if text.is_empty() {
        "no details".to_string()
    } else {
        text
    }
}
