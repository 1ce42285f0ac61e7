//! Authentication: account registration, JWT issuance, and the bearer-token
//! middleware protecting the file API.
//!
//! Access tokens are short-lived HS256 JWTs; refresh tokens are opaque,
//! stored server-side, consumed on use, and dropped on logout. Passwords
//! are hashed with Argon2.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::{Request, State};
use axum::http::header;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::{Extension, Json};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;

use filesync_core::protocol::{LoginRequest, RefreshRequest, RegisterRequest, TokenResponse};

use crate::error::{ApiError, ApiResult};
use crate::repository::UserRecord;
use crate::state::AppState;

/// JWT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

/// Signing/verification keys, derived from the configured secret.
#[derive(Clone)]
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue an access token for a user.
    pub fn issue(&self, user: &UserRecord, ttl_secs: u64) -> ApiResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(ttl_secs as i64)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::Unauthorized(format!("failed to issue token: {}", e)))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| ApiError::Unauthorized(format!("invalid token: {}", e)))
    }
}

/// The authenticated principal, inserted by the middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

/// Extract `Bearer <token>` from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> ApiResult<String> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing Authorization header".into()))?;
    value
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
        .ok_or_else(|| ApiError::Unauthorized("Authorization header is not a bearer token".into()))
}

/// Middleware guarding the protected routes.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())?;
    let claims = state.auth.verify(&token)?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        username: claims.username,
    });
    Ok(next.run(request).await)
}

// ── Password hashing ──────────────────────────────────────────────────────────

fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Storage(format!("failed to hash password: {}", e)))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// POST /api/auth/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let username = request.username.trim();
    if username.len() < 3 {
        return Err(ApiError::Validation(
            "username must be at least 3 characters".into(),
        ));
    }
    if !request.email.contains('@') {
        return Err(ApiError::Validation("email address is invalid".into()));
    }
    if request.password.len() < 8 {
        return Err(ApiError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }

    let password_hash = hash_password(&request.password)?;
    let user = state.repo.create_user(
        username,
        request.email.trim(),
        &password_hash,
        state.config.default_quota,
    )?;

    tracing::info!(username = user.username.as_str(), "Account registered");
    Ok(Json(json!({
        "user_id": user.id,
        "username": user.username,
        "email": user.email,
        "storage_quota": user.storage_quota,
    })))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = state
        .repo
        .find_user_by_username(request.username.trim())?
        .ok_or_else(|| ApiError::Unauthorized("unknown username or wrong password".into()))?;

    if !verify_password(&request.password, &user.password_hash) {
        return Err(ApiError::Unauthorized(
            "unknown username or wrong password".into(),
        ));
    }
    if user.account_status != "ACTIVE" {
        return Err(ApiError::Forbidden("account is suspended".into()));
    }

    issue_token_pair(&state, &user).map(Json)
}

/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user_id = state
        .repo
        .take_refresh_token(&request.refresh_token)?
        .ok_or_else(|| ApiError::Unauthorized("refresh token is invalid or expired".into()))?;

    let user = state
        .repo
        .find_user_by_id(&user_id)?
        .ok_or_else(|| ApiError::Unauthorized("account no longer exists".into()))?;

    issue_token_pair(&state, &user).map(Json)
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    state.repo.delete_refresh_tokens_for(&user.user_id)?;
    tracing::info!(username = user.username.as_str(), "Logged out");
    Ok(Json(json!({ "message": "logged out" })))
}

fn issue_token_pair(state: &AppState, user: &UserRecord) -> ApiResult<TokenResponse> {
    let access_token = state.auth.issue(user, state.config.access_token_ttl_secs)?;

    let refresh_token = uuid::Uuid::new_v4().to_string();
    state.repo.insert_refresh_token(
        &refresh_token,
        &user.id,
        Utc::now() + Duration::days(state.config.refresh_token_ttl_days),
    )?;

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.config.access_token_ttl_secs,
        user_id: user.id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_user() -> UserRecord {
        UserRecord {
            id: "user-1".to_string(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            password_hash: String::new(),
            storage_quota: 1024,
            used_storage: 0,
            account_status: "ACTIVE".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_token_round_trip() {
        let keys = AuthKeys::new("test-secret");
        let token = keys.issue(&make_user(), 3600).unwrap();

        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.username, "alice");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let keys = AuthKeys::new("test-secret");
        let token = keys.issue(&make_user(), 3600).unwrap();

        let other = AuthKeys::new("different-secret");
        assert!(matches!(
            other.verify(&token),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let keys = AuthKeys::new("test-secret");
        assert!(keys.verify("not.a.jwt").is_err());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong password", &hash));
        assert!(!verify_password("correct horse battery", "not-a-phc-string"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "tok-123");
    }
}
