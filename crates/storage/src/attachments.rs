//! Encrypted media attachments. The server stores opaque blobs on disk and
//! their wrapped keys in this table; linking to a message is a one-shot
//! claim guarded in SQL.

use {sqlx::SqlitePool, uuid::Uuid};

use {
    crate::{Result, StoreError, conversations::parse_uuid},
    sotto_common::time::{from_ms, now_ms},
};

#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub uploaded_by: i64,
    pub message_id: Option<Uuid>,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub file_hash: String,
    pub encrypted_file_key: String,
    pub encrypted_metadata: String,
    pub file_size: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: String,
    conversation_id: String,
    uploaded_by: i64,
    message_id: Option<String>,
    file_path: String,
    thumbnail_path: Option<String>,
    file_hash: String,
    encrypted_file_key: String,
    encrypted_metadata: String,
    file_size: i64,
    created_at: i64,
}

impl TryFrom<AttachmentRow> for Attachment {
    type Error = StoreError;

    fn try_from(r: AttachmentRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&r.id)?,
            conversation_id: parse_uuid(&r.conversation_id)?,
            uploaded_by: r.uploaded_by,
            message_id: r.message_id.as_deref().map(parse_uuid).transpose()?,
            file_path: r.file_path,
            thumbnail_path: r.thumbnail_path,
            file_hash: r.file_hash,
            encrypted_file_key: r.encrypted_file_key,
            encrypted_metadata: r.encrypted_metadata,
            file_size: r.file_size,
            created_at: from_ms(r.created_at),
        })
    }
}

pub struct NewAttachment {
    pub conversation_id: Uuid,
    pub uploaded_by: i64,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub file_hash: String,
    pub encrypted_file_key: String,
    pub encrypted_metadata: String,
    pub file_size: i64,
}

#[derive(Clone)]
pub struct AttachmentRepo {
    pool: SqlitePool,
}

impl AttachmentRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewAttachment) -> Result<Attachment> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO attachments
               (id, conversation_id, uploaded_by, file_path, thumbnail_path, file_hash,
                encrypted_file_key, encrypted_metadata, file_size, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(new.conversation_id.to_string())
        .bind(new.uploaded_by)
        .bind(&new.file_path)
        .bind(&new.thumbnail_path)
        .bind(&new.file_hash)
        .bind(&new.encrypted_file_key)
        .bind(&new.encrypted_metadata)
        .bind(new.file_size)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.by_id(id).await
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Attachment> {
        sqlx::query_as::<_, AttachmentRow>("SELECT * FROM attachments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(StoreError::NotFound("attachment"))
    }

    /// Claim the attachment for a message. The WHERE clause enforces
    /// `uploaded_by = sender AND message_id IS NULL`, so a second link (or a
    /// foreign sender) affects zero rows.
    pub async fn link_to_message(
        &self,
        attachment_id: Uuid,
        message_id: Uuid,
        sender_id: i64,
    ) -> Result<bool> {
        let linked = sqlx::query(
            "UPDATE attachments SET message_id = ? WHERE id = ? AND uploaded_by = ? AND message_id IS NULL",
        )
        .bind(message_id.to_string())
        .bind(attachment_id.to_string())
        .bind(sender_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(linked > 0)
    }
}
