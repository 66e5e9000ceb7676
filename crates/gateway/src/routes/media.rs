//! Encrypted media: multipart upload to the blob directory, restricted
//! download, and wrapped-key retrieval. Blobs are ciphertext end to end;
//! the server checks sizes and ownership, never content.

use std::sync::Arc;

use {
    axum::{
        Json,
        body::Body,
        extract::{Multipart, Path, State},
        http::{HeaderMap, HeaderValue, StatusCode, header},
        response::{IntoResponse, Response},
    },
    serde_json::json,
    tracing::{info, warn},
    uuid::Uuid,
};

use sotto_protocol::{MAX_FILE_BYTES, MAX_THUMBNAIL_BYTES};
use sotto_storage::attachments::NewAttachment;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub async fn upload(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut encrypted_file: Option<Vec<u8>> = None;
    let mut encrypted_thumbnail: Option<Vec<u8>> = None;
    let mut conversation_id: Option<Uuid> = None;
    let mut encrypted_file_key: Option<String> = None;
    let mut encrypted_metadata: Option<String> = None;
    let mut file_hash: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "encrypted_file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::bad_request("unreadable encrypted_file"))?;
                if bytes.len() > MAX_FILE_BYTES {
                    return Err(ApiError::bad_request("file exceeds 100 MiB"));
                }
                encrypted_file = Some(bytes.to_vec());
            }
            "encrypted_thumbnail" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::bad_request("unreadable encrypted_thumbnail"))?;
                if bytes.len() > MAX_THUMBNAIL_BYTES {
                    return Err(ApiError::bad_request("thumbnail exceeds 512 KiB"));
                }
                encrypted_thumbnail = Some(bytes.to_vec());
            }
            "conversation_id" => {
                let text = field.text().await.unwrap_or_default();
                conversation_id =
                    Some(Uuid::parse_str(&text).map_err(|_| {
                        ApiError::bad_request("conversation_id is not a UUID")
                    })?);
            }
            "encrypted_file_key" => encrypted_file_key = Some(field.text().await.unwrap_or_default()),
            "encrypted_metadata" => encrypted_metadata = Some(field.text().await.unwrap_or_default()),
            "file_hash" => file_hash = Some(field.text().await.unwrap_or_default()),
            // encrypted_file_size is advisory; the blob length is authoritative.
            _ => {
                let _ = field.bytes().await;
            }
        }
    }

    let encrypted_file =
        encrypted_file.ok_or_else(|| ApiError::bad_request("encrypted_file is required"))?;
    let conversation_id =
        conversation_id.ok_or_else(|| ApiError::bad_request("conversation_id is required"))?;
    let encrypted_file_key =
        encrypted_file_key.ok_or_else(|| ApiError::bad_request("encrypted_file_key is required"))?;
    let file_hash = file_hash.ok_or_else(|| ApiError::bad_request("file_hash is required"))?;
    if file_hash.len() != 64 || !file_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ApiError::bad_request("file_hash must be SHA-256 hex"));
    }

    state
        .conversations
        .require_participant(conversation_id, user_id)
        .await?;

    // Blob layout: media/<uuid>.bin (+ .thumb).
    let blob_id = Uuid::new_v4();
    let dir = std::path::Path::new(&state.config.media_dir);
    let file_path = dir.join(format!("{blob_id}.bin"));
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| storage_io_error("create media dir", &e))?;
    tokio::fs::write(&file_path, &encrypted_file)
        .await
        .map_err(|e| storage_io_error("write blob", &e))?;

    let thumbnail_path = match &encrypted_thumbnail {
        Some(thumb) => {
            let path = dir.join(format!("{blob_id}.thumb"));
            tokio::fs::write(&path, thumb)
                .await
                .map_err(|e| storage_io_error("write thumbnail", &e))?;
            Some(path.to_string_lossy().into_owned())
        }
        None => None,
    };

    let attachment = state
        .attachments
        .insert(NewAttachment {
            conversation_id,
            uploaded_by: user_id,
            file_path: file_path.to_string_lossy().into_owned(),
            thumbnail_path,
            file_hash,
            encrypted_file_key,
            encrypted_metadata: encrypted_metadata.unwrap_or_default(),
            file_size: encrypted_file.len() as i64,
        })
        .await?;

    info!(attachment_id = %attachment.id, size = attachment.file_size, "media uploaded");
    Ok(Json(json!({
        "attachment_id": attachment.id,
        "download_url": format!("/chat/media/{}/download/", attachment.id),
        "key_url": format!("/chat/media/{}/key/", attachment.id),
    })))
}

fn storage_io_error(what: &str, e: &std::io::Error) -> ApiError {
    warn!(error = %e, what, "media io failure");
    ApiError::bad_request("storage failure")
}

/// Participants only; for an unlinked attachment only the uploader.
async fn authorize_access(
    state: &Arc<AppState>,
    attachment: &sotto_storage::attachments::Attachment,
    user_id: i64,
) -> ApiResult<()> {
    if attachment.message_id.is_none() {
        if attachment.uploaded_by != user_id {
            return Err(ApiError::forbidden("attachment is not yet shared"));
        }
        return Ok(());
    }
    state
        .conversations
        .require_participant(attachment.conversation_id, user_id)
        .await?;
    Ok(())
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<Response> {
    let attachment = state.attachments.by_id(attachment_id).await?;
    authorize_access(&state, &attachment, user_id).await?;

    let bytes = tokio::fs::read(&attachment.file_path)
        .await
        .map_err(|_| ApiError::not_found("attachment blob"))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&attachment.file_hash) {
        headers.insert("x-file-hash", value);
    }
    headers.insert("x-is-encrypted", HeaderValue::from_static("true"));

    Ok((StatusCode::OK, headers, Body::from(bytes)).into_response())
}

pub async fn key(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(attachment_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let attachment = state.attachments.by_id(attachment_id).await?;
    authorize_access(&state, &attachment, user_id).await?;

    Ok(Json(json!({
        "encrypted_file_key": attachment.encrypted_file_key,
        "encrypted_metadata": attachment.encrypted_metadata,
        "file_hash": attachment.file_hash,
        "is_encrypted": true,
    })))
}
