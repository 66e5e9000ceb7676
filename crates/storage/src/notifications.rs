//! Notification rows, per-user preferences, and mute rules.

use {
    chrono::{DateTime, Utc},
    sqlx::SqlitePool,
    uuid::Uuid,
};

use {
    crate::{
        Result, StoreError,
        conversations::parse_uuid,
        types::{Notification, NotificationPreferences},
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: String,
    recipient_id: i64,
    sender_id: Option<i64>,
    notification_type: String,
    title: String,
    body: String,
    data: String,
    source_type: Option<String>,
    source_id: Option<String>,
    is_read: i64,
    fcm_sent: i64,
    fcm_message_id: Option<String>,
    fcm_error: Option<String>,
    created_at: i64,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(r: NotificationRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&r.id)?,
            recipient_id: r.recipient_id,
            sender_id: r.sender_id,
            notification_type: r.notification_type,
            title: r.title,
            body: r.body,
            data: serde_json::from_str(&r.data).unwrap_or_default(),
            source_type: r.source_type,
            source_id: r.source_id,
            is_read: r.is_read != 0,
            fcm_sent: r.fcm_sent != 0,
            fcm_message_id: r.fcm_message_id,
            fcm_error: r.fcm_error,
            created_at: from_ms(r.created_at),
        })
    }
}

pub struct NewNotification {
    pub recipient_id: i64,
    pub sender_id: Option<i64>,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
}

#[derive(Clone)]
pub struct NotificationRepo {
    pool: SqlitePool,
}

impl NotificationRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: NewNotification) -> Result<Notification> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"INSERT INTO notifications
               (id, recipient_id, sender_id, notification_type, title, body, data,
                source_type, source_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(new.recipient_id)
        .bind(new.sender_id)
        .bind(&new.notification_type)
        .bind(&new.title)
        .bind(&new.body)
        .bind(new.data.to_string())
        .bind(&new.source_type)
        .bind(&new.source_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        self.by_id(id).await
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Notification> {
        sqlx::query_as::<_, NotificationRow>("SELECT * FROM notifications WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(StoreError::NotFound("notification"))
    }

    /// Unread count; the iOS badge number.
    pub async fn unread_count(&self, recipient_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notifications WHERE recipient_id = ? AND is_read = 0",
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_read(&self, recipient_id: i64, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND recipient_id = ?")
            .bind(id.to_string())
            .bind(recipient_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cursor-paginated history, newest first.
    pub async fn history(
        &self,
        recipient_id: i64,
        before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let before_ms = before.map_or(i64::MAX, |t| t.timestamp_millis());
        sqlx::query_as::<_, NotificationRow>(
            r#"SELECT * FROM notifications
               WHERE recipient_id = ? AND created_at < ?
               ORDER BY created_at DESC, id DESC LIMIT ?"#,
        )
        .bind(recipient_id)
        .bind(before_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    /// Record the vendor outcome on the originating row.
    pub async fn stamp_fcm_result(
        &self,
        id: Uuid,
        sent: bool,
        message_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE notifications SET fcm_sent = ?, fcm_message_id = ?, fcm_error = ? WHERE id = ?",
        )
        .bind(i64::from(sent))
        .bind(message_id)
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── Preferences ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct PreferencesRow {
    user_id: i64,
    new_message: i64,
    message_reaction: i64,
    mention: i64,
    incoming_call: i64,
    missed_call: i64,
    group_invite: i64,
    channel_post: i64,
    security_alert: i64,
    dnd_enabled: i64,
    dnd_start: Option<String>,
    dnd_end: Option<String>,
    show_preview: i64,
    sound_enabled: i64,
    vibration_enabled: i64,
}

impl From<PreferencesRow> for NotificationPreferences {
    fn from(r: PreferencesRow) -> Self {
        Self {
            user_id: r.user_id,
            new_message: r.new_message != 0,
            message_reaction: r.message_reaction != 0,
            mention: r.mention != 0,
            incoming_call: r.incoming_call != 0,
            missed_call: r.missed_call != 0,
            group_invite: r.group_invite != 0,
            channel_post: r.channel_post != 0,
            security_alert: r.security_alert != 0,
            dnd_enabled: r.dnd_enabled != 0,
            dnd_start: r.dnd_start,
            dnd_end: r.dnd_end,
            show_preview: r.show_preview != 0,
            sound_enabled: r.sound_enabled != 0,
            vibration_enabled: r.vibration_enabled != 0,
        }
    }
}

#[derive(Clone)]
pub struct PreferenceRepo {
    pool: SqlitePool,
}

impl PreferenceRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch preferences, creating the all-true default row on first sight.
    pub async fn get_or_create(&self, user_id: i64) -> Result<NotificationPreferences> {
        if let Some(row) = sqlx::query_as::<_, PreferencesRow>(
            "SELECT * FROM notification_preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.into());
        }

        sqlx::query(
            "INSERT INTO notification_preferences (user_id) VALUES (?) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(NotificationPreferences::defaults(user_id))
    }

    pub async fn update(&self, prefs: &NotificationPreferences) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO notification_preferences
               (user_id, new_message, message_reaction, mention, incoming_call, missed_call,
                group_invite, channel_post, security_alert, dnd_enabled, dnd_start, dnd_end,
                show_preview, sound_enabled, vibration_enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 new_message = excluded.new_message,
                 message_reaction = excluded.message_reaction,
                 mention = excluded.mention,
                 incoming_call = excluded.incoming_call,
                 missed_call = excluded.missed_call,
                 group_invite = excluded.group_invite,
                 channel_post = excluded.channel_post,
                 security_alert = excluded.security_alert,
                 dnd_enabled = excluded.dnd_enabled,
                 dnd_start = excluded.dnd_start,
                 dnd_end = excluded.dnd_end,
                 show_preview = excluded.show_preview,
                 sound_enabled = excluded.sound_enabled,
                 vibration_enabled = excluded.vibration_enabled"#,
        )
        .bind(prefs.user_id)
        .bind(i64::from(prefs.new_message))
        .bind(i64::from(prefs.message_reaction))
        .bind(i64::from(prefs.mention))
        .bind(i64::from(prefs.incoming_call))
        .bind(i64::from(prefs.missed_call))
        .bind(i64::from(prefs.group_invite))
        .bind(i64::from(prefs.channel_post))
        .bind(i64::from(prefs.security_alert))
        .bind(i64::from(prefs.dnd_enabled))
        .bind(&prefs.dnd_start)
        .bind(&prefs.dnd_end)
        .bind(i64::from(prefs.show_preview))
        .bind(i64::from(prefs.sound_enabled))
        .bind(i64::from(prefs.vibration_enabled))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── Mute rules ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MuteRepo {
    pool: SqlitePool,
}

impl MuteRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert a rule. `muted_until = None` mutes forever.
    pub async fn mute(
        &self,
        user_id: i64,
        target_type: &str,
        target_id: &str,
        muted_until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO mute_rules (user_id, target_type, target_id, muted_until, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(user_id, target_type, target_id) DO UPDATE SET
                 muted_until = excluded.muted_until"#,
        )
        .bind(user_id)
        .bind(target_type)
        .bind(target_id)
        .bind(muted_until.map(|t| t.timestamp_millis()))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unmute(&self, user_id: i64, target_type: &str, target_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM mute_rules WHERE user_id = ? AND target_type = ? AND target_id = ?",
        )
        .bind(user_id)
        .bind(target_type)
        .bind(target_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A rule is active when muted_until is NULL (forever) or in the future.
    pub async fn is_muted(&self, user_id: i64, target_type: &str, target_id: &str) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM mute_rules
               WHERE user_id = ? AND target_type = ? AND target_id = ?
                 AND (muted_until IS NULL OR muted_until > ?)"#,
        )
        .bind(user_id)
        .bind(target_type)
        .bind(target_id)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Delete rules whose expiry has passed; run from the scheduler.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query(
            "DELETE FROM mute_rules WHERE muted_until IS NOT NULL AND muted_until <= ?",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(purged)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::users::UserRepo};

    async fn setup() -> (SqlitePool, i64) {
        let pool = crate::test_pool().await;
        let user = UserRepo::new(pool.clone())
            .create("a@example.com", "a", "h")
            .await
            .unwrap();
        (pool, user.id)
    }

    #[tokio::test]
    async fn badge_counts_unread_only() {
        let (pool, user) = setup().await;
        let repo = NotificationRepo::new(pool);
        let first = repo
            .insert(NewNotification {
                recipient_id: user,
                sender_id: None,
                notification_type: "new_message".into(),
                title: "t".into(),
                body: "b".into(),
                data: serde_json::json!({}),
                source_type: None,
                source_id: None,
            })
            .await
            .unwrap();
        assert_eq!(repo.unread_count(user).await.unwrap(), 1);
        repo.mark_read(user, first.id).await.unwrap();
        assert_eq!(repo.unread_count(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fcm_outcome_is_stamped() {
        let (pool, user) = setup().await;
        let repo = NotificationRepo::new(pool);
        let n = repo
            .insert(NewNotification {
                recipient_id: user,
                sender_id: None,
                notification_type: "new_message".into(),
                title: "t".into(),
                body: "b".into(),
                data: serde_json::json!({}),
                source_type: None,
                source_id: None,
            })
            .await
            .unwrap();
        repo.stamp_fcm_result(n.id, true, Some("mid-1"), None).await.unwrap();
        let stamped = repo.by_id(n.id).await.unwrap();
        assert!(stamped.fcm_sent);
        assert_eq!(stamped.fcm_message_id.as_deref(), Some("mid-1"));
    }

    #[tokio::test]
    async fn preferences_auto_create_with_defaults() {
        let (pool, user) = setup().await;
        let repo = PreferenceRepo::new(pool);
        let prefs = repo.get_or_create(user).await.unwrap();
        assert!(prefs.new_message && prefs.security_alert);
        assert!(!prefs.dnd_enabled);

        let mut updated = prefs;
        updated.new_message = false;
        updated.dnd_enabled = true;
        updated.dnd_start = Some("22:00".into());
        updated.dnd_end = Some("07:00".into());
        repo.update(&updated).await.unwrap();

        let fetched = repo.get_or_create(user).await.unwrap();
        assert!(!fetched.new_message);
        assert_eq!(fetched.dnd_start.as_deref(), Some("22:00"));
    }

    #[tokio::test]
    async fn mute_rules_respect_expiry_and_forever() {
        let (pool, user) = setup().await;
        let repo = MuteRepo::new(pool);

        repo.mute(user, "conversation", "c1", None).await.unwrap();
        assert!(repo.is_muted(user, "conversation", "c1").await.unwrap());

        let past = Utc::now() - chrono::Duration::minutes(1);
        repo.mute(user, "conversation", "c2", Some(past)).await.unwrap();
        assert!(!repo.is_muted(user, "conversation", "c2").await.unwrap());

        assert_eq!(repo.purge_expired().await.unwrap(), 1);
        // The forever rule survives purging.
        assert!(repo.is_muted(user, "conversation", "c1").await.unwrap());

        repo.unmute(user, "conversation", "c1").await.unwrap();
        assert!(!repo.is_muted(user, "conversation", "c1").await.unwrap());
    }
}
