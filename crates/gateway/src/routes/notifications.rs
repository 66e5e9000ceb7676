//! Device registration, notification preferences, and history.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
    },
    chrono::{DateTime, Utc},
    serde::Deserialize,
    serde_json::json,
    uuid::Uuid,
};

use sotto_common::time::to_rfc3339;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Deserialize)]
pub struct RegisterDeviceBody {
    pub device_id: String,
    pub token: String,
    pub platform: String,
}

pub async fn register_device(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<RegisterDeviceBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.device_id.trim().is_empty() || body.token.trim().is_empty() {
        return Err(ApiError::bad_request("device_id and token are required"));
    }
    if !matches!(body.platform.as_str(), "android" | "ios" | "web") {
        return Err(ApiError::bad_request("platform must be android, ios, or web"));
    }
    state
        .devices
        .upsert(user_id, body.device_id.trim(), body.token.trim(), &body.platform)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let prefs = state.preferences.get_or_create(user_id).await?;
    Ok(Json(serde_json::to_value(&prefs).unwrap_or_default()))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct PatchPreferencesBody {
    pub new_message: Option<bool>,
    pub message_reaction: Option<bool>,
    pub mention: Option<bool>,
    pub incoming_call: Option<bool>,
    pub missed_call: Option<bool>,
    pub group_invite: Option<bool>,
    pub channel_post: Option<bool>,
    pub security_alert: Option<bool>,
    pub dnd_enabled: Option<bool>,
    pub dnd_start: Option<String>,
    pub dnd_end: Option<String>,
    pub show_preview: Option<bool>,
    pub sound_enabled: Option<bool>,
    pub vibration_enabled: Option<bool>,
}

pub async fn patch_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<PatchPreferencesBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut prefs = state.preferences.get_or_create(user_id).await?;

    macro_rules! apply {
        ($($field:ident),*) => {
            $(if let Some(value) = body.$field { prefs.$field = value; })*
        };
    }
    apply!(
        new_message,
        message_reaction,
        mention,
        incoming_call,
        missed_call,
        group_invite,
        channel_post,
        security_alert,
        dnd_enabled,
        show_preview,
        sound_enabled,
        vibration_enabled
    );
    if let Some(start) = body.dnd_start {
        prefs.dnd_start = Some(start);
    }
    if let Some(end) = body.dnd_end {
        prefs.dnd_end = Some(end);
    }

    for bound in [&prefs.dnd_start, &prefs.dnd_end] {
        if let Some(bound) = bound {
            if chrono::NaiveTime::parse_from_str(bound, "%H:%M").is_err() {
                return Err(ApiError::bad_request("DND bounds must be HH:MM"));
            }
        }
    }

    state.preferences.update(&prefs).await?;
    Ok(Json(serde_json::to_value(&prefs).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub cursor: Option<String>,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let before = match &query.cursor {
        Some(cursor) => Some(
            DateTime::parse_from_rfc3339(cursor)
                .map_err(|_| ApiError::bad_request("cursor is not a valid timestamp"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let page = state.notifications.history(user_id, before, 50).await?;
    let next_cursor = (page.len() == 50)
        .then(|| page.last().map(|n| to_rfc3339(n.created_at)))
        .flatten();

    let results: Vec<serde_json::Value> = page
        .iter()
        .map(|n| {
            json!({
                "id": n.id,
                "notification_type": n.notification_type,
                "title": n.title,
                "body": n.body,
                "data": n.data,
                "is_read": n.is_read,
                "created_at": to_rfc3339(n.created_at),
            })
        })
        .collect();
    Ok(Json(json!({
        "results": results,
        "next_cursor": next_cursor,
        "unread_count": state.notifications.unread_count(user_id).await?,
    })))
}

pub async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.notifications.mark_read(user_id, notification_id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct MuteBody {
    pub target_type: String,
    pub target_id: String,
    /// RFC 3339 expiry; omitted means forever.
    #[serde(default)]
    pub muted_until: Option<String>,
}

pub async fn mute(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<MuteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if !matches!(body.target_type.as_str(), "conversation" | "group" | "channel") {
        return Err(ApiError::bad_request("unknown mute target type"));
    }
    let muted_until = match &body.muted_until {
        Some(ts) => Some(
            DateTime::parse_from_rfc3339(ts)
                .map_err(|_| ApiError::bad_request("muted_until is not a valid timestamp"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    state
        .mutes
        .mute(user_id, &body.target_type, &body.target_id, muted_until)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
pub struct UnmuteBody {
    pub target_type: String,
    pub target_id: String,
}

pub async fn unmute(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<UnmuteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .mutes
        .unmute(user_id, &body.target_type, &body.target_id)
        .await?;
    Ok(Json(json!({ "ok": true })))
}
