//! Messages, per-recipient envelopes, delivery statuses, and reactions.

use {
    chrono::{DateTime, Utc},
    sqlx::SqlitePool,
    std::collections::HashMap,
    uuid::Uuid,
};

use {
    crate::{
        Result, StoreError,
        conversations::parse_uuid,
        types::{DeliveryStatus, Message},
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: i64,
    message_type: String,
    content: Vec<u8>,
    created_at: i64,
    is_deleted: i64,
    is_edited: i64,
    edited_at: Option<i64>,
    reply_to_id: Option<String>,
    forwarded_from_id: Option<String>,
    attachment_id: Option<String>,
    encrypted_file_key: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(r: MessageRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&r.id)?,
            conversation_id: parse_uuid(&r.conversation_id)?,
            sender_id: r.sender_id,
            message_type: r.message_type,
            content: r.content,
            created_at: from_ms(r.created_at),
            is_deleted: r.is_deleted != 0,
            is_edited: r.is_edited != 0,
            edited_at: r.edited_at.map(from_ms),
            reply_to_id: r.reply_to_id.as_deref().map(parse_uuid).transpose()?,
            forwarded_from_id: r.forwarded_from_id.as_deref().map(parse_uuid).transpose()?,
            attachment_id: r.attachment_id.as_deref().map(parse_uuid).transpose()?,
            encrypted_file_key: r.encrypted_file_key,
        })
    }
}

pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: i64,
    pub message_type: String,
    pub content: Vec<u8>,
    pub reply_to_id: Option<Uuid>,
    pub forwarded_from_id: Option<Uuid>,
    pub attachment_id: Option<Uuid>,
    pub encrypted_file_key: Option<String>,
}

/// Messages a mark-as-read pass upgraded, grouped by their sender so one
/// `status.update` event can go to each.
pub struct ReadBackfill {
    pub by_sender: HashMap<i64, Vec<Uuid>>,
}

#[derive(Clone)]
pub struct MessageRepo {
    pool: SqlitePool,
}

impl MessageRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewMessage) -> Result<Message> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO messages
               (id, conversation_id, sender_id, message_type, content, created_at,
                reply_to_id, forwarded_from_id, attachment_id, encrypted_file_key)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(new.conversation_id.to_string())
        .bind(new.sender_id)
        .bind(&new.message_type)
        .bind(&new.content)
        .bind(now_ms())
        .bind(new.reply_to_id.map(|u| u.to_string()))
        .bind(new.forwarded_from_id.map(|u| u.to_string()))
        .bind(new.attachment_id.map(|u| u.to_string()))
        .bind(&new.encrypted_file_key)
        .execute(&self.pool)
        .await?;
        self.by_id(id).await
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Message> {
        sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(StoreError::NotFound("message"))
    }

    /// Descending page; `before` is the cursor (created_at of the previous
    /// page's oldest row). Rows cleared by the viewer stay hidden.
    pub async fn list_page(
        &self,
        conversation_id: Uuid,
        cleared_at: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let cleared_ms = cleared_at.map_or(0, |t| t.timestamp_millis());
        let before_ms = before.map_or(i64::MAX, |t| t.timestamp_millis());
        sqlx::query_as::<_, MessageRow>(
            r#"SELECT * FROM messages
               WHERE conversation_id = ? AND created_at > ? AND created_at < ?
               ORDER BY created_at DESC, id DESC
               LIMIT ?"#,
        )
        .bind(conversation_id.to_string())
        .bind(cleared_ms)
        .bind(before_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    // ── Per-recipient envelopes ─────────────────────────────────────────

    pub async fn insert_recipients(
        &self,
        message_id: Uuid,
        envelopes: &HashMap<i64, Vec<u8>>,
    ) -> Result<()> {
        for (user_id, ciphertext) in envelopes {
            sqlx::query(
                r#"INSERT INTO message_recipients (message_id, user_id, content) VALUES (?, ?, ?)
                   ON CONFLICT(message_id, user_id) DO UPDATE SET content = excluded.content"#,
            )
            .bind(message_id.to_string())
            .bind(user_id)
            .bind(ciphertext)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn recipient_envelope(&self, message_id: Uuid, user_id: i64) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT content FROM message_recipients WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(c,)| c))
    }

    // ── Edit / delete ───────────────────────────────────────────────────

    /// Replace ciphertext iff the requester is the sender and the message is
    /// inside the edit window.
    pub async fn edit(
        &self,
        message_id: Uuid,
        requester_id: i64,
        new_content: &[u8],
        window_secs: i64,
    ) -> Result<Message> {
        let message = self.by_id(message_id).await?;
        if message.sender_id != requester_id {
            return Err(StoreError::Forbidden("only the sender can edit"));
        }
        if message.is_deleted {
            return Err(StoreError::NotFound("message"));
        }
        let now = now_ms();
        if now - message.created_at.timestamp_millis() > window_secs * 1000 {
            return Err(StoreError::Forbidden("edit window has closed"));
        }

        sqlx::query("UPDATE messages SET content = ?, is_edited = 1, edited_at = ? WHERE id = ?")
            .bind(new_content)
            .bind(now)
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        self.by_id(message_id).await
    }

    /// Soft tombstone: ciphertext cleared, flags set, recipient envelopes
    /// scrubbed.
    pub async fn soft_delete(&self, message_id: Uuid, requester_id: i64) -> Result<Message> {
        let message = self.by_id(message_id).await?;
        if message.sender_id != requester_id {
            return Err(StoreError::Forbidden("only the sender can delete"));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE messages SET content = x'', is_deleted = 1 WHERE id = ?")
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE message_recipients SET content = x'' WHERE message_id = ?")
            .bind(message_id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.by_id(message_id).await
    }

    // ── Reactions ───────────────────────────────────────────────────────

    /// Toggle the caller's reaction. Returns `"add"` or `"remove"`.
    pub async fn toggle_reaction(
        &self,
        message_id: Uuid,
        user_id: i64,
        emoji: &str,
        remove: bool,
    ) -> Result<&'static str> {
        if remove {
            sqlx::query("DELETE FROM message_reactions WHERE message_id = ? AND user_id = ?")
                .bind(message_id.to_string())
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            return Ok("remove");
        }

        sqlx::query(
            r#"INSERT INTO message_reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(message_id, user_id) DO UPDATE SET emoji = excluded.emoji"#,
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .bind(emoji)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok("add")
    }

    // ── Delivery status lattice ─────────────────────────────────────────

    /// Upsert a status row, moving only up the `sent < delivered < read`
    /// lattice. Returns whether the row changed.
    pub async fn upsert_status(
        &self,
        message_id: Uuid,
        user_id: i64,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let changed = sqlx::query(
            r#"INSERT INTO message_status (message_id, user_id, status, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(message_id, user_id) DO UPDATE SET
                 status = excluded.status,
                 updated_at = excluded.updated_at
               WHERE (excluded.status = 'read' AND message_status.status != 'read')
                  OR (excluded.status = 'delivered' AND message_status.status = 'sent')"#,
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .bind(status.as_str())
        .bind(now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }

    pub async fn status_of(&self, message_id: Uuid, user_id: i64) -> Result<Option<DeliveryStatus>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM message_status WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(s,)| DeliveryStatus::parse(&s)))
    }

    /// Upgrade every non-sender, not-yet-read message in the conversation to
    /// `read` for `reader_id`, creating missing rows. Grouped by sender for
    /// the status events.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        reader_id: i64,
    ) -> Result<ReadBackfill> {
        let pending: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT m.id, m.sender_id FROM messages m
               LEFT JOIN message_status s ON s.message_id = m.id AND s.user_id = ?
               WHERE m.conversation_id = ? AND m.sender_id != ? AND m.is_deleted = 0
                 AND (s.status IS NULL OR s.status != 'read')"#,
        )
        .bind(reader_id)
        .bind(conversation_id.to_string())
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_sender: HashMap<i64, Vec<Uuid>> = HashMap::new();
        for (id, sender_id) in pending {
            let message_id = parse_uuid(&id)?;
            self.upsert_status(message_id, reader_id, DeliveryStatus::Read)
                .await?;
            by_sender.entry(sender_id).or_default().push(message_id);
        }
        Ok(ReadBackfill { by_sender })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{conversations::ConversationRepo, users::UserRepo},
    };

    async fn setup() -> (MessageRepo, ConversationRepo, Uuid, i64, i64) {
        let pool = crate::test_pool().await;
        let users = UserRepo::new(pool.clone());
        let a = users.create("a@example.com", "a", "h").await.unwrap().id;
        let b = users.create("b@example.com", "b", "h").await.unwrap().id;
        let convs = ConversationRepo::new(pool.clone());
        let conv = convs.open_private(a, b).await.unwrap().conversation;
        (MessageRepo::new(pool), convs, conv.id, a, b)
    }

    fn text_message(conversation_id: Uuid, sender_id: i64, content: &[u8]) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id,
            message_type: "text".into(),
            content: content.to_vec(),
            reply_to_id: None,
            forwarded_from_id: None,
            attachment_id: None,
            encrypted_file_key: None,
        }
    }

    #[tokio::test]
    async fn insert_and_page() {
        let (repo, _, conv, a, _) = setup().await;
        for i in 0..3u8 {
            repo.insert(text_message(conv, a, &[i])).await.unwrap();
        }
        let page = repo.list_page(conv, None, None, 50).await.unwrap();
        assert_eq!(page.len(), 3);
        // Descending by creation.
        assert!(page[0].created_at >= page[2].created_at);
    }

    #[tokio::test]
    async fn cleared_at_hides_history() {
        let (repo, _, conv, a, _) = setup().await;
        let old = repo.insert(text_message(conv, a, b"old")).await.unwrap();
        let cutoff = old.created_at + chrono::Duration::milliseconds(1);
        // Everything at or before the cutoff stays hidden.
        let page = repo.list_page(conv, Some(cutoff), None, 50).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn edit_is_sender_only() {
        let (repo, _, conv, a, b) = setup().await;
        let message = repo.insert(text_message(conv, a, b"v1")).await.unwrap();
        assert!(matches!(
            repo.edit(message.id, b, b"v2", 900).await.unwrap_err(),
            StoreError::Forbidden(_)
        ));
        let edited = repo.edit(message.id, a, b"v2", 900).await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, b"v2");
    }

    #[tokio::test]
    async fn edit_window_closes() {
        let (repo, _, conv, a, _) = setup().await;
        let message = repo.insert(text_message(conv, a, b"v1")).await.unwrap();
        // A zero-second window is already closed by the time we edit.
        assert!(repo.edit(message.id, a, b"v2", 0).await.is_err());
    }

    #[tokio::test]
    async fn delete_scrubs_envelopes() {
        let (repo, _, conv, a, b) = setup().await;
        let message = repo.insert(text_message(conv, a, b"secret")).await.unwrap();
        let envelopes = HashMap::from([(b, b"envelope-b".to_vec())]);
        repo.insert_recipients(message.id, &envelopes).await.unwrap();

        let deleted = repo.soft_delete(message.id, a).await.unwrap();
        assert!(deleted.is_deleted);
        assert!(deleted.content.is_empty());
        assert_eq!(repo.recipient_envelope(message.id, b).await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn status_lattice_never_regresses() {
        let (repo, _, conv, a, b) = setup().await;
        let message = repo.insert(text_message(conv, a, b"x")).await.unwrap();

        assert!(repo.upsert_status(message.id, b, DeliveryStatus::Delivered).await.unwrap());
        assert!(repo.upsert_status(message.id, b, DeliveryStatus::Read).await.unwrap());
        // Read → delivered is a downgrade and must not change the row.
        assert!(!repo.upsert_status(message.id, b, DeliveryStatus::Delivered).await.unwrap());
        assert_eq!(
            repo.status_of(message.id, b).await.unwrap().unwrap(),
            DeliveryStatus::Read
        );
    }

    #[tokio::test]
    async fn duplicate_delivered_is_a_noop() {
        let (repo, _, conv, a, b) = setup().await;
        let message = repo.insert(text_message(conv, a, b"x")).await.unwrap();
        assert!(repo.upsert_status(message.id, b, DeliveryStatus::Delivered).await.unwrap());
        assert!(!repo.upsert_status(message.id, b, DeliveryStatus::Delivered).await.unwrap());
    }

    #[tokio::test]
    async fn mark_read_backfills_missing_rows() {
        let (repo, convs, conv, a, b) = setup().await;
        let m1 = repo.insert(text_message(conv, a, b"1")).await.unwrap();
        let m2 = repo.insert(text_message(conv, a, b"2")).await.unwrap();
        let mine = repo.insert(text_message(conv, b, b"own")).await.unwrap();

        let backfill = repo.mark_conversation_read(conv, b).await.unwrap();
        let ids = backfill.by_sender.get(&a).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&m1.id) && ids.contains(&m2.id));
        // Own messages are not upgraded.
        assert!(repo.status_of(mine.id, b).await.unwrap().is_none());

        convs.reset_unread(conv, b).await.unwrap();
        assert_eq!(
            convs.participant(conv, b).await.unwrap().unwrap().unread_count,
            0
        );
    }

    #[tokio::test]
    async fn reaction_toggle_rewrites_and_removes() {
        let (repo, _, conv, a, b) = setup().await;
        let message = repo.insert(text_message(conv, a, b"x")).await.unwrap();

        assert_eq!(repo.toggle_reaction(message.id, b, "👍", false).await.unwrap(), "add");
        assert_eq!(repo.toggle_reaction(message.id, b, "❤️", false).await.unwrap(), "add");

        let row: (String,) = sqlx::query_as(
            "SELECT emoji FROM message_reactions WHERE message_id = ? AND user_id = ?",
        )
        .bind(message.id.to_string())
        .bind(b)
        .fetch_one(&repo.pool)
        .await
        .unwrap();
        assert_eq!(row.0, "❤️");

        assert_eq!(repo.toggle_reaction(message.id, b, "", true).await.unwrap(), "remove");
    }
}
