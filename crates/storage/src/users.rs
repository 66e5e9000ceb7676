//! User accounts, presence, and email verification codes.

use {sqlx::SqlitePool, tracing::debug};

use {
    crate::{
        Result, StoreError,
        types::User,
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    username: String,
    password_hash: String,
    is_verified: i64,
    lock_pin_hash: Option<String>,
    is_online: i64,
    last_seen: Option<i64>,
    created_at: i64,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.id,
            email: r.email,
            username: r.username,
            password_hash: r.password_hash,
            is_verified: r.is_verified != 0,
            lock_pin_hash: r.lock_pin_hash,
            is_online: r.is_online != 0,
            last_seen: r.last_seen.map(from_ms),
            created_at: from_ms(r.created_at),
        }
    }
}

#[derive(Clone)]
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an account. Emails are case-folded before the unique check.
    pub async fn create(&self, email: &str, username: &str, password_hash: &str) -> Result<User> {
        let email = email.trim().to_lowercase();
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO users (email, username, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&email)
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let id = done.last_insert_rowid();
                debug!(user_id = id, "user created");
                self.by_id(id).await
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict("email or username already registered"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn by_id(&self, id: i64) -> Result<User> {
        sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(StoreError::NotFound("user"))
    }

    pub async fn by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        Ok(sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE email = ? AND is_deleted = 0",
        )
        .bind(&email)
        .fetch_optional(&self.pool)
        .await?
        .map(Into::into))
    }

    pub async fn set_online(&self, user_id: i64, online: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ?, last_seen = ? WHERE id = ?")
            .bind(i64::from(online))
            .bind(now_ms())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_verified(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET is_verified = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft delete keeps the row for referential integrity.
    pub async fn soft_delete(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET is_deleted = 1, is_online = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Email verification ──────────────────────────────────────────────

    pub async fn store_verification_code(
        &self,
        email: &str,
        code: &str,
        ttl_secs: i64,
    ) -> Result<()> {
        let email = email.trim().to_lowercase();
        sqlx::query(
            r#"INSERT INTO email_verifications (email, code, expires_at) VALUES (?, ?, ?)
               ON CONFLICT(email) DO UPDATE SET code = excluded.code, expires_at = excluded.expires_at"#,
        )
        .bind(&email)
        .bind(code)
        .bind(now_ms() + ttl_secs * 1000)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consume a verification code; the row is deleted on success.
    pub async fn consume_verification_code(&self, email: &str, code: &str) -> Result<bool> {
        let email = email.trim().to_lowercase();
        let deleted = sqlx::query(
            "DELETE FROM email_verifications WHERE email = ? AND code = ? AND expires_at > ?",
        )
        .bind(&email)
        .bind(code)
        .bind(now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch() {
        let repo = UserRepo::new(crate::test_pool().await);
        let user = repo.create("Alice@Example.com", "alice", "h").await.unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert!(!user.is_verified);
        assert_eq!(repo.by_id(user.id).await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn duplicate_email_conflicts_case_insensitively() {
        let repo = UserRepo::new(crate::test_pool().await);
        repo.create("a@example.com", "a", "h").await.unwrap();
        let err = repo.create("A@EXAMPLE.COM", "b", "h").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn presence_updates_last_seen() {
        let repo = UserRepo::new(crate::test_pool().await);
        let user = repo.create("a@example.com", "a", "h").await.unwrap();
        repo.set_online(user.id, true).await.unwrap();
        let fetched = repo.by_id(user.id).await.unwrap();
        assert!(fetched.is_online);
        assert!(fetched.last_seen.is_some());
    }

    #[tokio::test]
    async fn verification_code_is_single_use() {
        let repo = UserRepo::new(crate::test_pool().await);
        repo.create("a@example.com", "a", "h").await.unwrap();
        repo.store_verification_code("a@example.com", "123456", 600)
            .await
            .unwrap();
        assert!(!repo.consume_verification_code("a@example.com", "999999").await.unwrap());
        assert!(repo.consume_verification_code("a@example.com", "123456").await.unwrap());
        assert!(!repo.consume_verification_code("a@example.com", "123456").await.unwrap());
    }

    #[tokio::test]
    async fn soft_deleted_user_is_gone() {
        let repo = UserRepo::new(crate::test_pool().await);
        let user = repo.create("a@example.com", "a", "h").await.unwrap();
        repo.soft_delete(user.id).await.unwrap();
        assert!(matches!(
            repo.by_id(user.id).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }
}
