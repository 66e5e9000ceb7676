//! Conversations and their participant rows.

use {sqlx::SqlitePool, uuid::Uuid};

use {
    crate::{
        Result, StoreError,
        types::{Conversation, ConversationType, Participant},
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    conv_type: String,
    only_admins_can_send: i64,
    last_message_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ConversationRow> for Conversation {
    type Error = StoreError;

    fn try_from(r: ConversationRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&r.id)?,
            conv_type: ConversationType::parse(&r.conv_type)
                .ok_or_else(|| StoreError::validation(format!("bad conv_type {}", r.conv_type)))?,
            only_admins_can_send: r.only_admins_can_send != 0,
            last_message_id: r.last_message_id.as_deref().map(parse_uuid).transpose()?,
            created_at: from_ms(r.created_at),
            updated_at: from_ms(r.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    conversation_id: String,
    user_id: i64,
    role: String,
    unread_count: i64,
    muted_until: Option<i64>,
    cleared_at: Option<i64>,
    is_hidden: i64,
    is_locked: i64,
    is_favorite: i64,
    is_blocked: i64,
    last_read_at: Option<i64>,
}

impl TryFrom<ParticipantRow> for Participant {
    type Error = StoreError;

    fn try_from(r: ParticipantRow) -> Result<Self> {
        Ok(Self {
            conversation_id: parse_uuid(&r.conversation_id)?,
            user_id: r.user_id,
            role: r.role,
            unread_count: r.unread_count,
            muted_until: r.muted_until.map(from_ms),
            cleared_at: r.cleared_at.map(from_ms),
            is_hidden: r.is_hidden != 0,
            is_locked: r.is_locked != 0,
            is_favorite: r.is_favorite != 0,
            is_blocked: r.is_blocked != 0,
            last_read_at: r.last_read_at.map(from_ms),
        })
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| StoreError::validation(format!("bad uuid {s}")))
}

/// Outcome of opening a private conversation.
pub struct PrivateConversation {
    pub conversation: Conversation,
    pub created: bool,
    /// The caller had hidden this conversation and is re-opening it; clients
    /// must re-establish their ratchet session.
    pub session_reset: bool,
}

#[derive(Clone)]
pub struct ConversationRepo {
    pool: SqlitePool,
}

impl ConversationRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the private conversation between two users.
    ///
    /// Re-opening one the caller had hidden unhides it and flags
    /// `session_reset`.
    pub async fn open_private(&self, caller_id: i64, peer_id: i64) -> Result<PrivateConversation> {
        if caller_id == peer_id {
            return Err(StoreError::validation("cannot open a conversation with yourself"));
        }

        let existing: Option<(String, i64)> = sqlx::query_as(
            r#"SELECT p1.conversation_id, p1.is_hidden
               FROM conversation_participants p1
               JOIN conversation_participants p2
                 ON p1.conversation_id = p2.conversation_id AND p2.user_id = ?
               JOIN conversations c ON c.id = p1.conversation_id AND c.conv_type = 'private'
               WHERE p1.user_id = ?"#,
        )
        .bind(peer_id)
        .bind(caller_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((conv_id, was_hidden)) = existing {
            if was_hidden != 0 {
                sqlx::query(
                    "UPDATE conversation_participants SET is_hidden = 0 WHERE conversation_id = ? AND user_id = ?",
                )
                .bind(&conv_id)
                .bind(caller_id)
                .execute(&self.pool)
                .await?;
            }
            return Ok(PrivateConversation {
                conversation: self.by_id(parse_uuid(&conv_id)?).await?,
                created: false,
                session_reset: was_hidden != 0,
            });
        }

        let conversation = self
            .create(ConversationType::Private, caller_id, &[peer_id], false)
            .await?;
        Ok(PrivateConversation {
            conversation,
            created: true,
            session_reset: false,
        })
    }

    /// Create a conversation with `creator` as admin and `members` as members.
    pub async fn create(
        &self,
        conv_type: ConversationType,
        creator_id: i64,
        member_ids: &[i64],
        only_admins_can_send: bool,
    ) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversations (id, conv_type, only_admins_can_send, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(conv_type.as_str())
        .bind(i64::from(only_admins_can_send))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO conversation_participants (conversation_id, user_id, role) VALUES (?, ?, 'admin')",
        )
        .bind(id.to_string())
        .bind(creator_id)
        .execute(&mut *tx)
        .await?;

        for member in member_ids {
            if *member == creator_id {
                continue;
            }
            sqlx::query(
                "INSERT INTO conversation_participants (conversation_id, user_id, role) VALUES (?, ?, 'member')",
            )
            .bind(id.to_string())
            .bind(member)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.by_id(id).await
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Conversation> {
        sqlx::query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(StoreError::NotFound("conversation"))
    }

    pub async fn participant(&self, conversation_id: Uuid, user_id: i64) -> Result<Option<Participant>> {
        sqlx::query_as::<_, ParticipantRow>(
            "SELECT * FROM conversation_participants WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    /// The participant row, or Forbidden when the user is not in the
    /// conversation (or is blocked there).
    pub async fn require_participant(&self, conversation_id: Uuid, user_id: i64) -> Result<Participant> {
        let participant = self
            .participant(conversation_id, user_id)
            .await?
            .ok_or(StoreError::Forbidden("not a participant"))?;
        if participant.is_blocked {
            return Err(StoreError::Forbidden("participant is blocked"));
        }
        Ok(participant)
    }

    pub async fn participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        sqlx::query_as::<_, ParticipantRow>(
            "SELECT * FROM conversation_participants WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    pub async fn participant_ids(&self, conversation_id: Uuid) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM conversation_participants WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Conversation ids for the session router's subscription set.
    pub async fn conversation_ids_for_user(&self, user_id: i64) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT conversation_id FROM conversation_participants WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    /// Paginated, most-recently-active first, excluding hidden ones.
    pub async fn list_for_user(&self, user_id: i64, limit: i64, offset: i64) -> Result<Vec<Conversation>> {
        sqlx::query_as::<_, ConversationRow>(
            r#"SELECT c.* FROM conversations c
               JOIN conversation_participants p ON p.conversation_id = c.id
               WHERE p.user_id = ? AND p.is_hidden = 0
               ORDER BY c.updated_at DESC
               LIMIT ? OFFSET ?"#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    /// Point the conversation at its newest message and bump activity.
    pub async fn set_last_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(message_id.to_string())
            .bind(now_ms())
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// DB-side increment for everyone except the sender.
    pub async fn increment_unread(&self, conversation_id: Uuid, except_user: i64) -> Result<()> {
        sqlx::query(
            "UPDATE conversation_participants SET unread_count = unread_count + 1 WHERE conversation_id = ? AND user_id != ?",
        )
        .bind(conversation_id.to_string())
        .bind(except_user)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn reset_unread(&self, conversation_id: Uuid, user_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE conversation_participants SET unread_count = 0, last_read_at = ? WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(now_ms())
        .bind(conversation_id.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::users::UserRepo};

    async fn setup() -> (SqlitePool, i64, i64) {
        let pool = crate::test_pool().await;
        let users = UserRepo::new(pool.clone());
        let a = users.create("a@example.com", "a", "h").await.unwrap().id;
        let b = users.create("b@example.com", "b", "h").await.unwrap().id;
        (pool, a, b)
    }

    #[tokio::test]
    async fn open_private_is_idempotent() {
        let (pool, a, b) = setup().await;
        let repo = ConversationRepo::new(pool);

        let first = repo.open_private(a, b).await.unwrap();
        assert!(first.created);
        assert!(!first.session_reset);

        let second = repo.open_private(b, a).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.conversation.id, first.conversation.id);
    }

    #[tokio::test]
    async fn reopening_hidden_flags_session_reset() {
        let (pool, a, b) = setup().await;
        let repo = ConversationRepo::new(pool.clone());
        let conv = repo.open_private(a, b).await.unwrap().conversation;

        sqlx::query(
            "UPDATE conversation_participants SET is_hidden = 1 WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conv.id.to_string())
        .bind(a)
        .execute(&pool)
        .await
        .unwrap();

        let reopened = repo.open_private(a, b).await.unwrap();
        assert!(reopened.session_reset);
        let participant = repo.participant(conv.id, a).await.unwrap().unwrap();
        assert!(!participant.is_hidden);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let (pool, a, _) = setup().await;
        let repo = ConversationRepo::new(pool);
        assert!(matches!(
            repo.open_private(a, a).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn unread_increments_skip_sender() {
        let (pool, a, b) = setup().await;
        let repo = ConversationRepo::new(pool);
        let conv = repo.open_private(a, b).await.unwrap().conversation;

        repo.increment_unread(conv.id, a).await.unwrap();
        repo.increment_unread(conv.id, a).await.unwrap();

        assert_eq!(repo.participant(conv.id, b).await.unwrap().unwrap().unread_count, 2);
        assert_eq!(repo.participant(conv.id, a).await.unwrap().unwrap().unread_count, 0);

        repo.reset_unread(conv.id, b).await.unwrap();
        let participant = repo.participant(conv.id, b).await.unwrap().unwrap();
        assert_eq!(participant.unread_count, 0);
        assert!(participant.last_read_at.is_some());
    }

    #[tokio::test]
    async fn group_creator_is_admin() {
        let (pool, a, b) = setup().await;
        let repo = ConversationRepo::new(pool);
        let conv = repo
            .create(ConversationType::Group, a, &[b], true)
            .await
            .unwrap();
        assert!(conv.only_admins_can_send);
        assert!(repo.participant(conv.id, a).await.unwrap().unwrap().is_admin());
        assert!(!repo.participant(conv.id, b).await.unwrap().unwrap().is_admin());
    }
}
