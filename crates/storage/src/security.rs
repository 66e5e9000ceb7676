//! Security alerts: identity changes, excessive fetches, prekey exhaustion.

use sqlx::SqlitePool;

use {
    crate::{Result, types::SecurityAlert},
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    user_id: i64,
    alert_type: String,
    severity: String,
    message: String,
    metadata: String,
    is_resolved: i64,
    created_at: i64,
}

impl From<AlertRow> for SecurityAlert {
    fn from(r: AlertRow) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            alert_type: r.alert_type,
            severity: r.severity,
            message: r.message,
            metadata: serde_json::from_str(&r.metadata).unwrap_or_default(),
            is_resolved: r.is_resolved != 0,
            created_at: from_ms(r.created_at),
        }
    }
}

#[derive(Clone)]
pub struct SecurityAlertRepo {
    pool: SqlitePool,
}

impl SecurityAlertRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn raise(
        &self,
        user_id: i64,
        alert_type: &str,
        severity: &str,
        message: &str,
        metadata: serde_json::Value,
    ) -> Result<i64> {
        let done = sqlx::query(
            r#"INSERT INTO security_alerts (user_id, alert_type, severity, message, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(user_id)
        .bind(alert_type)
        .bind(severity)
        .bind(message)
        .bind(metadata.to_string())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(done.last_insert_rowid())
    }

    pub async fn unresolved_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<SecurityAlert>> {
        Ok(sqlx::query_as::<_, AlertRow>(
            r#"SELECT * FROM security_alerts WHERE user_id = ? AND is_resolved = 0
               ORDER BY created_at DESC LIMIT ?"#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Into::into)
        .collect())
    }

    pub async fn resolve(&self, user_id: i64, alert_id: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE security_alerts SET is_resolved = 1, resolved_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(now_ms())
        .bind(alert_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::users::UserRepo};

    #[tokio::test]
    async fn raise_list_resolve() {
        let pool = crate::test_pool().await;
        let user = UserRepo::new(pool.clone())
            .create("a@example.com", "a", "h")
            .await
            .unwrap();
        let repo = SecurityAlertRepo::new(pool);

        let id = repo
            .raise(
                user.id,
                "identity_change",
                "high",
                "identity key changed",
                serde_json::json!({"old_key_prefix": "abcd", "new_key_prefix": "ef01", "ip": "10.0.0.1"}),
            )
            .await
            .unwrap();

        let alerts = repo.unresolved_for_user(user.id, 20).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "identity_change");
        assert_eq!(alerts[0].metadata["ip"], "10.0.0.1");

        assert!(repo.resolve(user.id, id).await.unwrap());
        assert!(repo.unresolved_for_user(user.id, 20).await.unwrap().is_empty());
        // Resolving someone else's alert is a no-op.
        assert!(!repo.resolve(user.id + 1, id).await.unwrap());
    }
}
