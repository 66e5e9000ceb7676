//! The X3DH key service: bundle upload/fetch, prekey replenishment,
//! ratchet session blobs, safety numbers, and security alerts.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{ConnectInfo, Path, State},
        http::HeaderMap,
    },
    base64::Engine,
    serde::Deserialize,
    serde_json::json,
    tracing::{info, warn},
};

use {
    sotto_common::time::now_secs,
    sotto_crypto::bundle::{CryptoVersion, PublicBundle},
    sotto_protocol::{FETCH_ALERT_THRESHOLD, MAX_PREKEYS_PER_REPLENISH},
    sotto_storage::types::KeyBundle,
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const REPLENISH_PER_HOUR: i64 = 10;

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, ApiError> {
    b64()
        .decode(value)
        .map_err(|_| ApiError::bad_request(format!("{name} is not valid base64")))
}

fn client_ip(headers: &HeaderMap, addr: std::net::SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

// ── Upload ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PrekeyUpload {
    pub key_id: i64,
    pub public_key: String,
}

#[derive(Deserialize)]
pub struct UploadBundleBody {
    pub crypto_version: u8,
    pub identity_key_public: String,
    pub identity_dh_key_public: String,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub signed_prekey_id: i64,
    #[serde(default)]
    pub signed_prekey_timestamp: Option<i64>,
    #[serde(default)]
    pub one_time_prekeys: Vec<PrekeyUpload>,
}

pub async fn upload_bundle(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    Json(body): Json<UploadBundleBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let version = CryptoVersion::from_u8(body.crypto_version)?;

    let bundle = PublicBundle {
        version,
        identity_key: decode_field("identity_key_public", &body.identity_key_public)?,
        identity_dh_key: decode_field("identity_dh_key_public", &body.identity_dh_key_public)?,
        signed_prekey: decode_field("signed_prekey_public", &body.signed_prekey_public)?,
        signed_prekey_signature: decode_field(
            "signed_prekey_signature",
            &body.signed_prekey_signature,
        )?,
        signed_prekey_timestamp: body.signed_prekey_timestamp.unwrap_or_else(now_secs),
    };
    // Signature failure rejects the whole upload. The returned timestamp is
    // the signed one (embedded in the blob for v1).
    let timestamp = bundle.validate(now_secs())?;

    // A changed identity key is a security event, not an error.
    if let Some(existing) = state.keys.bundle(user_id).await? {
        if existing.identity_key != bundle.identity_key {
            let ip = client_ip(&headers, addr);
            warn!(user_id, ip = %ip, "identity key changed");
            state
                .alerts
                .raise(
                    user_id,
                    "identity_change",
                    "high",
                    "identity key was replaced",
                    json!({
                        "old_key_prefix": hex::encode(&existing.identity_key[..8.min(existing.identity_key.len())]),
                        "new_key_prefix": hex::encode(&bundle.identity_key[..8.min(bundle.identity_key.len())]),
                        "ip": ip,
                    }),
                )
                .await?;
        }
    }

    state
        .keys
        .upsert_bundle(&KeyBundle {
            user_id,
            crypto_version: body.crypto_version,
            identity_key: bundle.identity_key,
            identity_dh_key: bundle.identity_dh_key,
            signed_prekey: bundle.signed_prekey,
            signed_prekey_signature: bundle.signed_prekey_signature,
            signed_prekey_id: body.signed_prekey_id,
            signed_prekey_timestamp: timestamp,
            updated_at: chrono::Utc::now(),
        })
        .await?;

    let mut accepted = 0;
    for prekey in &body.one_time_prekeys {
        match b64().decode(&prekey.public_key) {
            Ok(key) if key.len() == version.dh_key_len() => {
                state.keys.upsert_prekey(user_id, prekey.key_id, &key).await?;
                accepted += 1;
            }
            _ => warn!(user_id, key_id = prekey.key_id, "discarding malformed prekey"),
        }
    }

    info!(user_id, accepted, "key bundle uploaded");
    Ok(Json(json!({ "ok": true, "one_time_prekeys_accepted": accepted })))
}

// ── Fetch ────────────────────────────────────────────────────────────────────

pub async fn fetch_bundle(
    State(state): State<Arc<AppState>>,
    AuthUser(requester_id): AuthUser,
    Path(target_id): Path<i64>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> ApiResult<Json<serde_json::Value>> {
    if requester_id == target_id {
        return Err(ApiError::forbidden("cannot fetch your own bundle"));
    }

    let ip = client_ip(&headers, addr);
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state
        .keys
        .log_fetch(requester_id, target_id, &ip, user_agent)
        .await?;

    let recent = state.keys.fetches_in_last_hour(requester_id).await?;
    if recent > FETCH_ALERT_THRESHOLD {
        state
            .alerts
            .raise(
                requester_id,
                "excessive_fetch",
                "medium",
                "unusually many key bundle fetches",
                json!({ "fetches_last_hour": recent, "ip": ip }),
            )
            .await?;
    }

    let bundle = state
        .keys
        .bundle(target_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key bundle"))?;

    // Atomic consumption: exactly one requester wins a given key id.
    let one_time_prekey = state.keys.claim_prekey(target_id, requester_id).await?;
    let remaining = state.keys.unused_prekey_count(target_id).await?;
    if remaining == 0 {
        state
            .alerts
            .raise(
                target_id,
                "prekey_exhaustion",
                "medium",
                "one-time prekey pool is empty",
                json!({ "requested_by": requester_id }),
            )
            .await?;
    }

    Ok(Json(json!({
        "user_id": target_id,
        "crypto_version": bundle.crypto_version,
        "identity_key_public": b64().encode(&bundle.identity_key),
        "identity_dh_key_public": b64().encode(&bundle.identity_dh_key),
        "signed_prekey_public": b64().encode(&bundle.signed_prekey),
        "signed_prekey_signature": b64().encode(&bundle.signed_prekey_signature),
        "signed_prekey_id": bundle.signed_prekey_id,
        "signed_prekey_timestamp": bundle.signed_prekey_timestamp,
        "one_time_prekey_id": one_time_prekey.as_ref().map(|p| p.key_id),
        "one_time_prekey": one_time_prekey.as_ref().map(|p| b64().encode(&p.public_key)),
        "prekeys_remaining": remaining,
    })))
}

// ── Replenish / rotate ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReplenishBody {
    pub one_time_prekeys: Vec<PrekeyUpload>,
}

pub async fn replenish_prekeys(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ReplenishBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.one_time_prekeys.len() > MAX_PREKEYS_PER_REPLENISH {
        return Err(ApiError::bad_request(format!(
            "at most {MAX_PREKEYS_PER_REPLENISH} prekeys per call"
        )));
    }
    state
        .check_user_rate(user_id, "prekey_replenish", REPLENISH_PER_HOUR)
        .await?;

    let bundle = state
        .keys
        .bundle(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key bundle"))?;
    let version = CryptoVersion::from_u8(bundle.crypto_version)?;

    let mut accepted = 0;
    for prekey in &body.one_time_prekeys {
        match b64().decode(&prekey.public_key) {
            Ok(key) if key.len() == version.dh_key_len() => {
                state.keys.upsert_prekey(user_id, prekey.key_id, &key).await?;
                accepted += 1;
            }
            _ => warn!(user_id, key_id = prekey.key_id, "discarding malformed prekey"),
        }
    }

    let remaining = state.keys.unused_prekey_count(user_id).await?;
    Ok(Json(json!({ "accepted": accepted, "prekeys_remaining": remaining })))
}

#[derive(Deserialize)]
pub struct RotateBody {
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub signed_prekey_id: i64,
    #[serde(default)]
    pub signed_prekey_timestamp: Option<i64>,
}

pub async fn rotate_signed_prekey(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<RotateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .check_user_rate(user_id, "signed_prekey_rotate", REPLENISH_PER_HOUR)
        .await?;

    let bundle = state
        .keys
        .bundle(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key bundle"))?;
    let signed_prekey = decode_field("signed_prekey_public", &body.signed_prekey_public)?;
    let signature = decode_field("signed_prekey_signature", &body.signed_prekey_signature)?;

    // Both versions verify against the stored identity key before anything
    // persists.
    let version = CryptoVersion::from_u8(bundle.crypto_version)?;
    if signed_prekey.len() != version.dh_key_len() {
        return Err(ApiError::bad_request("bad signed prekey length"));
    }
    let timestamp = match version {
        CryptoVersion::V1 => sotto_crypto::bundle::verify_signed_prekey_v1(
            &bundle.identity_key,
            &signed_prekey,
            &signature,
            now_secs(),
        )?,
        CryptoVersion::V2 => {
            let timestamp = body.signed_prekey_timestamp.unwrap_or_else(now_secs);
            sotto_crypto::bundle::verify_signed_prekey_v2(
                &bundle.identity_key,
                &signed_prekey,
                &signature,
                timestamp,
                now_secs(),
            )?;
            timestamp
        }
    };

    state
        .keys
        .rotate_signed_prekey(user_id, &signed_prekey, &signature, body.signed_prekey_id, timestamp)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Safety number ────────────────────────────────────────────────────────────

pub async fn safety_number(
    State(state): State<Arc<AppState>>,
    AuthUser(requester_id): AuthUser,
    Path(peer_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let mine = state
        .keys
        .bundle(requester_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key bundle"))?;
    let theirs = state
        .keys
        .bundle(peer_id)
        .await?
        .ok_or_else(|| ApiError::not_found("key bundle"))?;

    let (formatted, raw) = sotto_crypto::safety_number(&mine.identity_key, &theirs.identity_key);
    let qr_data = sotto_crypto::safety_qr_data(
        &mine.identity_key,
        requester_id,
        &theirs.identity_key,
        peer_id,
    );
    Ok(Json(json!({
        "safety_number": formatted,
        "safety_number_raw": raw,
        "qr_data": qr_data,
    })))
}

// ── Ratchet sessions (opaque blobs) ──────────────────────────────────────────

#[derive(Deserialize)]
pub struct RatchetBody {
    /// Base64; the server never looks inside.
    pub state: String,
}

pub async fn put_ratchet_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    Path(peer_id): Path<i64>,
    Json(body): Json<RatchetBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let blob = decode_field("state", &body.state)?;
    state.keys.store_ratchet_session(owner_id, peer_id, &blob).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn get_ratchet_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    Path(peer_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let blob = state
        .keys
        .ratchet_session(owner_id, peer_id)
        .await?
        .ok_or_else(|| ApiError::not_found("ratchet session"))?;
    Ok(Json(json!({ "state": b64().encode(&blob) })))
}

pub async fn delete_ratchet_session(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    Path(peer_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.keys.delete_ratchet_session(owner_id, peer_id).await?;
    Ok(Json(json!({ "ok": true })))
}

// ── Security alerts ──────────────────────────────────────────────────────────

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let alerts = state.alerts.unresolved_for_user(user_id, 20).await?;
    let items: Vec<serde_json::Value> = alerts
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "alert_type": a.alert_type,
                "severity": a.severity,
                "message": a.message,
                "metadata": a.metadata,
                "created_at": sotto_common::time::to_rfc3339(a.created_at),
            })
        })
        .collect();
    Ok(Json(json!({ "alerts": items })))
}

#[derive(Deserialize)]
pub struct ResolveAlertBody {
    pub alert_id: i64,
}

pub async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<ResolveAlertBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.alerts.resolve(user_id, body.alert_id).await? {
        return Err(ApiError::not_found("alert"));
    }
    Ok(Json(json!({ "ok": true })))
}
