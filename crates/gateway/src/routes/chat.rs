//! Conversation and message REST surface. The send path mirrors the WS
//! pipeline exactly; it exists for clients that cannot hold a socket.

use std::sync::Arc;

use {
    axum::{
        Json,
        extract::{Path, Query, State},
    },
    base64::Engine,
    chrono::{DateTime, Utc},
    serde::Deserialize,
    serde_json::json,
    uuid::Uuid,
};

use {
    sotto_common::time::to_rfc3339,
    sotto_protocol::{MESSAGE_PAGE_SIZE, SendMessage},
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: i64,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let page = query.page.max(0);
    let page_size = 20;
    let conversations = state
        .conversations
        .list_for_user(user_id, page_size, page * page_size)
        .await?;

    let mut items = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let participant = state
            .conversations
            .participant(conversation.id, user_id)
            .await?;
        items.push(json!({
            "id": conversation.id,
            "conv_type": conversation.conv_type.as_str(),
            "last_message_id": conversation.last_message_id,
            "updated_at": to_rfc3339(conversation.updated_at),
            "unread_count": participant.as_ref().map_or(0, |p| p.unread_count),
            "is_favorite": participant.as_ref().is_some_and(|p| p.is_favorite),
            "muted_until": participant.and_then(|p| p.muted_until).map(to_rfc3339),
        }));
    }
    Ok(Json(json!({ "results": items, "page": page })))
}

#[derive(Deserialize)]
pub struct CreateConversationBody {
    pub user_id: i64,
}

pub async fn create_private_conversation(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<CreateConversationBody>,
) -> ApiResult<Json<serde_json::Value>> {
    // The peer must exist (and not be soft-deleted).
    state.users.by_id(body.user_id).await?;
    let opened = state.conversations.open_private(user_id, body.user_id).await?;
    Ok(Json(json!({
        "conversation_id": opened.conversation.id,
        "created": opened.created,
        "session_reset": opened.session_reset,
    })))
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    /// RFC 3339 timestamp of the previous page's oldest message.
    #[serde(default)]
    pub cursor: Option<String>,
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let participant = state
        .conversations
        .require_participant(conversation_id, user_id)
        .await?;

    let before = match &query.cursor {
        Some(cursor) => Some(
            DateTime::parse_from_rfc3339(cursor)
                .map_err(|_| ApiError::bad_request("cursor is not a valid timestamp"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let page = state
        .messages
        .list_page(conversation_id, participant.cleared_at, before, MESSAGE_PAGE_SIZE)
        .await?;
    let next_cursor = (page.len() as i64 == MESSAGE_PAGE_SIZE)
        .then(|| page.last().map(|m| to_rfc3339(m.created_at)))
        .flatten();

    let b64 = base64::engine::general_purpose::STANDARD;
    let results: Vec<serde_json::Value> = page
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "conversation_id": m.conversation_id,
                "sender_id": m.sender_id,
                "message_type": m.message_type,
                "content_encrypted": b64.encode(&m.content),
                "created_at": to_rfc3339(m.created_at),
                "is_deleted": m.is_deleted,
                "is_edited": m.is_edited,
                "edited_at": m.edited_at.map(to_rfc3339),
                "reply_to_id": m.reply_to_id,
                "attachment_id": m.attachment_id,
                "encrypted_file_key": m.encrypted_file_key,
            })
        })
        .collect();

    Ok(Json(json!({ "results": results, "next_cursor": next_cursor })))
}

#[derive(Deserialize)]
pub struct RestSendBody {
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default)]
    pub content_encrypted: String,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub attachment_id: Option<Uuid>,
    #[serde(default)]
    pub encrypted_file_key: Option<String>,
    #[serde(default)]
    pub encrypted_file_keys: Option<std::collections::HashMap<i64, String>>,
    #[serde(default)]
    pub recipients_encrypted: Option<std::collections::HashMap<i64, String>>,
}

fn default_message_type() -> String {
    "text".into()
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<RestSendBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let sent = state
        .chat
        .send_message(user_id, SendMessage {
            conversation_id,
            message_type: body.message_type,
            content_encrypted: body.content_encrypted,
            reply_to_id: body.reply_to_id,
            attachment_id: body.attachment_id,
            encrypted_file_key: body.encrypted_file_key,
            encrypted_file_keys: body.encrypted_file_keys,
            recipients_encrypted: body.recipients_encrypted,
        })
        .await?;
    Ok(Json(serde_json::to_value(&sent).unwrap_or_default()))
}

pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.chat.mark_as_read(user_id, conversation_id).await?;
    Ok(Json(json!({ "ok": true })))
}
