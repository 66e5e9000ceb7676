//! Registration, login, token lifecycle, and the bearer-token extractor.

use std::sync::Arc;

use {
    argon2::{
        Argon2,
        password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
    },
    axum::{
        Json,
        extract::{FromRequestParts, State},
        http::request::Parts,
    },
    rand::Rng,
    serde::Deserialize,
    serde_json::json,
    tracing::{info, warn},
};

use sotto_storage::tokens::TokenKind;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const VERIFICATION_CODE_TTL_SECS: i64 = 15 * 60;

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            warn!(error = %e, "password hashing failed");
            ApiError::bad_request("could not process password")
        })
}

#[must_use]
pub fn verify_password(password: &str, hash_str: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash_str) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Extractor resolving `Authorization: Bearer <token>` to a user id.
pub struct AuthUser(pub i64);

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthorized)?;
        let user_id = state
            .tokens
            .verify(token, TokenKind::Access)
            .await
            .map_err(|_| ApiError::unauthorized())?;
        Ok(Self(user_id))
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterBody {
    pub email: String,
    pub username: String,
    pub password: String,
    pub password_confirm: String,
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.password.len() < 8 {
        return Err(ApiError::bad_request("password must be at least 8 characters"));
    }
    if body.password != body.password_confirm {
        return Err(ApiError::bad_request("passwords do not match"));
    }
    if !body.email.contains('@') {
        return Err(ApiError::bad_request("email is not valid"));
    }
    if body.username.trim().is_empty() {
        return Err(ApiError::bad_request("username is required"));
    }

    let password_hash = hash_password(&body.password)?;
    let user = state
        .users
        .create(&body.email, body.username.trim(), &password_hash)
        .await?;

    // The verification code goes out through the mailer collaborator; the
    // row is what this service owns.
    let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
    state
        .users
        .store_verification_code(&user.email, &code, VERIFICATION_CODE_TTL_SECS)
        .await?;
    info!(user_id = user.id, "user registered, verification pending");

    Ok(Json(json!({
        "id": user.id,
        "email": user.email,
        "username": user.username,
        "verification_required": true,
    })))
}

#[derive(Deserialize)]
pub struct VerifyEmailBody {
    pub email: String,
    pub code: String,
}

pub async fn verify_email(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyEmailBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.users.consume_verification_code(&body.email, &body.code).await? {
        return Err(ApiError::bad_request("invalid or expired code"));
    }
    if let Some(user) = state.users.by_email(&body.email).await? {
        state.users.mark_verified(user.id).await?;
    }
    Ok(Json(json!({ "verified": true })))
}

#[derive(Deserialize)]
pub struct LoginBody {
    pub email: String,
    pub password: String,
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> ApiResult<Json<serde_json::Value>> {
    // One generic failure for unknown email and wrong password alike, so
    // the endpoint cannot be used to probe for accounts.
    let invalid = || ApiError::unauthorized();

    let user = state.users.by_email(&body.email).await?.ok_or_else(invalid)?;
    if !verify_password(&body.password, &user.password_hash) {
        return Err(invalid());
    }

    let access = state.tokens.issue(user.id, TokenKind::Access).await?;
    let refresh = state.tokens.issue(user.id, TokenKind::Refresh).await?;
    info!(user_id = user.id, "login");

    Ok(Json(json!({
        "access": access,
        "refresh": refresh,
        "user": {
            "id": user.id,
            "email": user.email,
            "username": user.username,
            "is_verified": user.is_verified,
        },
    })))
}

#[derive(Deserialize)]
pub struct RefreshBody {
    pub refresh: String,
}

pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (_, access, rotated) = state
        .tokens
        .refresh(&body.refresh)
        .await
        .map_err(|_| ApiError::unauthorized())?;
    Ok(Json(json!({ "access": access, "refresh": rotated })))
}

pub async fn logout(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.tokens.revoke(&body.refresh).await?;
    Ok(Json(json!({ "ok": true })))
}
