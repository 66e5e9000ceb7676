//! Bearer tokens: opaque random values stored as SHA-256 digests.
//!
//! The raw token is shown to the client exactly once; the database only
//! ever holds its hash. Logout revokes the refresh token (the blacklist is
//! the `revoked` flag), and refresh rotation revokes the old token in the
//! same step.

use {
    sha2::{Digest, Sha256},
    sqlx::SqlitePool,
};

use {
    crate::{Result, StoreError},
    sotto_common::time::now_ms,
};

pub const ACCESS_TTL_SECS: i64 = 3600; // 1 h
pub const REFRESH_TTL_SECS: i64 = 30 * 86_400; // 30 d

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }

    fn ttl_secs(self) -> i64 {
        match self {
            Self::Access => ACCESS_TTL_SECS,
            Self::Refresh => REFRESH_TTL_SECS,
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_token() -> String {
    use {base64::Engine, rand::RngCore};

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct TokenRepo {
    pool: SqlitePool,
}

impl TokenRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Issue a token for `user_id`. Returns the raw value.
    pub async fn issue(&self, user_id: i64, kind: TokenKind) -> Result<String> {
        let raw = generate_token();
        let now = now_ms();
        sqlx::query(
            "INSERT INTO auth_tokens (user_id, token_hash, kind, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(sha256_hex(&raw))
        .bind(kind.as_str())
        .bind(now + kind.ttl_secs() * 1000)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(raw)
    }

    /// Resolve a raw token to its user id, if live.
    pub async fn verify(&self, raw: &str, kind: TokenKind) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT user_id FROM auth_tokens WHERE token_hash = ? AND kind = ? AND revoked = 0 AND expires_at > ?",
        )
        .bind(sha256_hex(raw))
        .bind(kind.as_str())
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id,)| id)
            .ok_or(StoreError::Forbidden("invalid or expired token"))
    }

    /// Revoke a refresh token (logout). Unknown tokens are a no-op so the
    /// response cannot be used to probe for valid values.
    pub async fn revoke(&self, raw: &str) -> Result<()> {
        sqlx::query("UPDATE auth_tokens SET revoked = 1 WHERE token_hash = ?")
            .bind(sha256_hex(raw))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Exchange a refresh token for a new access token, rotating the
    /// refresh token itself.
    pub async fn refresh(&self, raw_refresh: &str) -> Result<(i64, String, String)> {
        let user_id = self.verify(raw_refresh, TokenKind::Refresh).await?;
        self.revoke(raw_refresh).await?;
        let access = self.issue(user_id, TokenKind::Access).await?;
        let rotated = self.issue(user_id, TokenKind::Refresh).await?;
        Ok((user_id, access, rotated))
    }

    /// Drop expired rows; run from the maintenance scheduler.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= ?")
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
    use super::*;

    async fn repo_with_user() -> (TokenRepo, i64) {
        let pool = crate::test_pool().await;
        let user = crate::users::UserRepo::new(pool.clone())
            .create("a@example.com", "a", "h")
            .await
            .unwrap();
        (TokenRepo::new(pool), user.id)
    }

    #[tokio::test]
    async fn issue_and_verify() {
        let (repo, user_id) = repo_with_user().await;
        let raw = repo.issue(user_id, TokenKind::Access).await.unwrap();
        assert_eq!(repo.verify(&raw, TokenKind::Access).await.unwrap(), user_id);
        // An access token is not a refresh token.
        assert!(repo.verify(&raw, TokenKind::Refresh).await.is_err());
    }

    #[tokio::test]
    async fn revoked_refresh_fails_verification() {
        let (repo, user_id) = repo_with_user().await;
        let raw = repo.issue(user_id, TokenKind::Refresh).await.unwrap();
        repo.revoke(&raw).await.unwrap();
        assert!(repo.verify(&raw, TokenKind::Refresh).await.is_err());
    }

    #[tokio::test]
    async fn refresh_rotates_the_old_token_out() {
        let (repo, user_id) = repo_with_user().await;
        let raw = repo.issue(user_id, TokenKind::Refresh).await.unwrap();
        let (uid, access, rotated) = repo.refresh(&raw).await.unwrap();
        assert_eq!(uid, user_id);
        assert!(repo.verify(&raw, TokenKind::Refresh).await.is_err());
        assert_eq!(repo.verify(&access, TokenKind::Access).await.unwrap(), user_id);
        assert_eq!(repo.verify(&rotated, TokenKind::Refresh).await.unwrap(), user_id);
    }

    #[tokio::test]
    async fn garbage_token_is_forbidden() {
        let (repo, _) = repo_with_user().await;
        assert!(matches!(
            repo.verify("nope", TokenKind::Access).await.unwrap_err(),
            StoreError::Forbidden(_)
        ));
    }
}
