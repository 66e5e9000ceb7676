//! Vendor push device tokens, upserted per (user, device).

use sqlx::SqlitePool;

use {
    crate::{Result, types::DeviceToken},
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct DeviceTokenRow {
    user_id: i64,
    device_id: String,
    token: String,
    platform: String,
    is_active: i64,
    last_used_at: i64,
}

impl From<DeviceTokenRow> for DeviceToken {
    fn from(r: DeviceTokenRow) -> Self {
        Self {
            user_id: r.user_id,
            device_id: r.device_id,
            token: r.token,
            platform: r.platform,
            is_active: r.is_active != 0,
            last_used_at: from_ms(r.last_used_at),
        }
    }
}

#[derive(Clone)]
pub struct DeviceTokenRepo {
    pool: SqlitePool,
}

impl DeviceTokenRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register (or refresh) a device. A re-registration reactivates a
    /// previously invalidated token.
    pub async fn upsert(&self, user_id: i64, device_id: &str, token: &str, platform: &str) -> Result<()> {
        let now = now_ms();
        sqlx::query(
            r#"INSERT INTO device_tokens (user_id, device_id, token, platform, is_active, last_used_at, created_at)
               VALUES (?, ?, ?, ?, 1, ?, ?)
               ON CONFLICT(user_id, device_id) DO UPDATE SET
                 token = excluded.token,
                 platform = excluded.platform,
                 is_active = 1,
                 last_used_at = excluded.last_used_at"#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(token)
        .bind(platform)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_for_user(&self, user_id: i64) -> Result<Vec<DeviceToken>> {
        Ok(sqlx::query_as::<_, DeviceTokenRow>(
            "SELECT user_id, device_id, token, platform, is_active, last_used_at FROM device_tokens WHERE user_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Into::into)
        .collect())
    }

    /// Reap a token the vendor reported as gone.
    pub async fn deactivate_token(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE device_tokens SET is_active = 0 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deactivate tokens idle longer than `max_idle_days`.
    pub async fn reap_stale(&self, max_idle_days: i64) -> Result<u64> {
        let reaped = sqlx::query(
            "UPDATE device_tokens SET is_active = 0 WHERE is_active = 1 AND last_used_at < ?",
        )
        .bind(now_ms() - max_idle_days * 86_400_000)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reaped)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::users::UserRepo};

    async fn setup() -> (DeviceTokenRepo, i64) {
        let pool = crate::test_pool().await;
        let user = UserRepo::new(pool.clone())
            .create("a@example.com", "a", "h")
            .await
            .unwrap();
        (DeviceTokenRepo::new(pool), user.id)
    }

    #[tokio::test]
    async fn upsert_replaces_token_for_device() {
        let (repo, user) = setup().await;
        repo.upsert(user, "phone", "tok-1", "android").await.unwrap();
        repo.upsert(user, "phone", "tok-2", "android").await.unwrap();
        let tokens = repo.active_for_user(user).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, "tok-2");
    }

    #[tokio::test]
    async fn deactivated_tokens_drop_out() {
        let (repo, user) = setup().await;
        repo.upsert(user, "phone", "tok-1", "android").await.unwrap();
        repo.upsert(user, "tablet", "tok-2", "ios").await.unwrap();
        repo.deactivate_token("tok-1").await.unwrap();
        let tokens = repo.active_for_user(user).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].device_id, "tablet");
        // Re-registering the device reactivates it.
        repo.upsert(user, "phone", "tok-3", "android").await.unwrap();
        assert_eq!(repo.active_for_user(user).await.unwrap().len(), 2);
    }
}
