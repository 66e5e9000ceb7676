//! X3DH key material: bundles, one-time prekeys, ratchet session blobs,
//! and the fetch audit log.

use {sqlx::SqlitePool, tracing::debug};

use {
    crate::{
        Result, StoreError,
        types::{KeyBundle, OneTimePrekey},
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct BundleRow {
    user_id: i64,
    crypto_version: i64,
    identity_key: Vec<u8>,
    identity_dh_key: Vec<u8>,
    signed_prekey: Vec<u8>,
    signed_prekey_signature: Vec<u8>,
    signed_prekey_id: i64,
    signed_prekey_timestamp: i64,
    updated_at: i64,
}

impl From<BundleRow> for KeyBundle {
    fn from(r: BundleRow) -> Self {
        Self {
            user_id: r.user_id,
            crypto_version: r.crypto_version as u8,
            identity_key: r.identity_key,
            identity_dh_key: r.identity_dh_key,
            signed_prekey: r.signed_prekey,
            signed_prekey_signature: r.signed_prekey_signature,
            signed_prekey_id: r.signed_prekey_id,
            signed_prekey_timestamp: r.signed_prekey_timestamp,
            updated_at: from_ms(r.updated_at),
        }
    }
}

#[derive(Clone)]
pub struct KeyRepo {
    pool: SqlitePool,
}

impl KeyRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ── Bundles ─────────────────────────────────────────────────────────

    pub async fn bundle(&self, user_id: i64) -> Result<Option<KeyBundle>> {
        Ok(sqlx::query_as::<_, BundleRow>("SELECT * FROM key_bundles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into))
    }

    pub async fn upsert_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO key_bundles
               (user_id, crypto_version, identity_key, identity_dh_key, signed_prekey,
                signed_prekey_signature, signed_prekey_id, signed_prekey_timestamp, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(user_id) DO UPDATE SET
                 crypto_version = excluded.crypto_version,
                 identity_key = excluded.identity_key,
                 identity_dh_key = excluded.identity_dh_key,
                 signed_prekey = excluded.signed_prekey,
                 signed_prekey_signature = excluded.signed_prekey_signature,
                 signed_prekey_id = excluded.signed_prekey_id,
                 signed_prekey_timestamp = excluded.signed_prekey_timestamp,
                 updated_at = excluded.updated_at"#,
        )
        .bind(bundle.user_id)
        .bind(i64::from(bundle.crypto_version))
        .bind(&bundle.identity_key)
        .bind(&bundle.identity_dh_key)
        .bind(&bundle.signed_prekey)
        .bind(&bundle.signed_prekey_signature)
        .bind(bundle.signed_prekey_id)
        .bind(bundle.signed_prekey_timestamp)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rotate only the signed prekey on an existing bundle.
    pub async fn rotate_signed_prekey(
        &self,
        user_id: i64,
        signed_prekey: &[u8],
        signature: &[u8],
        signed_prekey_id: i64,
        timestamp: i64,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"UPDATE key_bundles SET signed_prekey = ?, signed_prekey_signature = ?,
               signed_prekey_id = ?, signed_prekey_timestamp = ?, updated_at = ?
               WHERE user_id = ?"#,
        )
        .bind(signed_prekey)
        .bind(signature)
        .bind(signed_prekey_id)
        .bind(timestamp)
        .bind(now_ms())
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound("key bundle"));
        }
        Ok(())
    }

    // ── One-time prekeys ────────────────────────────────────────────────

    pub async fn upsert_prekey(&self, user_id: i64, key_id: i64, public_key: &[u8]) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO one_time_prekeys (user_id, key_id, public_key, created_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(user_id, key_id) DO NOTHING"#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(public_key)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consume the lowest unused prekey atomically. The single claim UPDATE
    /// is the row lock: exactly one caller wins a given key id.
    pub async fn claim_prekey(&self, user_id: i64, requester_id: i64) -> Result<Option<OneTimePrekey>> {
        let now = now_ms();
        let claimed: Option<(i64, Vec<u8>)> = sqlx::query_as(
            r#"UPDATE one_time_prekeys SET is_used = 1, used_by = ?, used_at = ?
               WHERE user_id = ? AND is_used = 0 AND key_id = (
                   SELECT key_id FROM one_time_prekeys
                   WHERE user_id = ? AND is_used = 0
                   ORDER BY key_id LIMIT 1
               )
               RETURNING key_id, public_key"#,
        )
        .bind(requester_id)
        .bind(now)
        .bind(user_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(key_id, public_key)| {
            debug!(user_id, key_id, requester_id, "one-time prekey consumed");
            OneTimePrekey {
                user_id,
                key_id,
                public_key,
                is_used: true,
                used_by: Some(requester_id),
                used_at: Some(from_ms(now)),
            }
        }))
    }

    pub async fn unused_prekey_count(&self, user_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM one_time_prekeys WHERE user_id = ? AND is_used = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// User ids whose unused pool fell to or below `threshold`; feeds the
    /// maintenance audit.
    pub async fn users_below_prekey_threshold(&self, threshold: i64) -> Result<Vec<(i64, i64)>> {
        Ok(sqlx::query_as(
            r#"SELECT user_id, remaining FROM (
                   SELECT b.user_id AS user_id,
                          (SELECT COUNT(*) FROM one_time_prekeys k
                           WHERE k.user_id = b.user_id AND k.is_used = 0) AS remaining
                   FROM key_bundles b
               ) WHERE remaining <= ?"#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?)
    }

    // ── Fetch audit log ─────────────────────────────────────────────────

    pub async fn log_fetch(
        &self,
        requester_id: i64,
        target_id: i64,
        ip: &str,
        user_agent: &str,
    ) -> Result<()> {
        let mut user_agent = user_agent.to_string();
        if user_agent.len() > 500 {
            let cut = (0..=500).rev().find(|i| user_agent.is_char_boundary(*i)).unwrap_or(0);
            user_agent.truncate(cut);
        }
        sqlx::query(
            "INSERT INTO key_fetch_log (requester_id, target_id, ip, user_agent, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(requester_id)
        .bind(target_id)
        .bind(ip)
        .bind(&user_agent)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fetches_in_last_hour(&self, requester_id: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM key_fetch_log WHERE requester_id = ? AND created_at > ?",
        )
        .bind(requester_id)
        .bind(now_ms() - 3_600_000)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn trim_fetch_log(&self, keep_hours: i64) -> Result<u64> {
        let trimmed = sqlx::query("DELETE FROM key_fetch_log WHERE created_at < ?")
            .bind(now_ms() - keep_hours * 3_600_000)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(trimmed)
    }

    // ── Rate events (replenish / rotate throttles) ──────────────────────

    pub async fn record_rate_event(&self, user_id: i64, scope: &str) -> Result<()> {
        sqlx::query("INSERT INTO rate_events (user_id, scope, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(scope)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn rate_events_in_window(
        &self,
        user_id: i64,
        scope: &str,
        window_secs: i64,
    ) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM rate_events WHERE user_id = ? AND scope = ? AND created_at > ?",
        )
        .bind(user_id)
        .bind(scope)
        .bind(now_ms() - window_secs * 1000)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // ── Ratchet sessions (opaque blobs) ─────────────────────────────────

    pub async fn store_ratchet_session(&self, owner_id: i64, peer_id: i64, state: &[u8]) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO ratchet_sessions (owner_id, peer_id, state, updated_at) VALUES (?, ?, ?, ?)
               ON CONFLICT(owner_id, peer_id) DO UPDATE SET
                 state = excluded.state, updated_at = excluded.updated_at"#,
        )
        .bind(owner_id)
        .bind(peer_id)
        .bind(state)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ratchet_session(&self, owner_id: i64, peer_id: i64) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT state FROM ratchet_sessions WHERE owner_id = ? AND peer_id = ?",
        )
        .bind(owner_id)
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(s,)| s))
    }

    pub async fn delete_ratchet_session(&self, owner_id: i64, peer_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM ratchet_sessions WHERE owner_id = ? AND peer_id = ?")
            .bind(owner_id)
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::users::UserRepo};

    async fn setup() -> (KeyRepo, i64, i64) {
        let pool = crate::test_pool().await;
        let users = UserRepo::new(pool.clone());
        let a = users.create("a@example.com", "a", "h").await.unwrap().id;
        let b = users.create("b@example.com", "b", "h").await.unwrap().id;
        (KeyRepo::new(pool), a, b)
    }

    fn bundle(user_id: i64, identity: u8) -> KeyBundle {
        KeyBundle {
            user_id,
            crypto_version: 2,
            identity_key: vec![identity; 32],
            identity_dh_key: vec![2; 32],
            signed_prekey: vec![3; 32],
            signed_prekey_signature: vec![4; 64],
            signed_prekey_id: 1,
            signed_prekey_timestamp: 0,
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn bundle_upsert_replaces() {
        let (repo, a, _) = setup().await;
        repo.upsert_bundle(&bundle(a, 1)).await.unwrap();
        repo.upsert_bundle(&bundle(a, 9)).await.unwrap();
        assert_eq!(repo.bundle(a).await.unwrap().unwrap().identity_key, vec![9; 32]);
    }

    #[tokio::test]
    async fn prekeys_claim_in_order_and_exactly_once() {
        let (repo, a, b) = setup().await;
        for key_id in [3, 1, 2] {
            repo.upsert_prekey(a, key_id, &[key_id as u8; 32]).await.unwrap();
        }
        assert_eq!(repo.unused_prekey_count(a).await.unwrap(), 3);

        let first = repo.claim_prekey(a, b).await.unwrap().unwrap();
        assert_eq!(first.key_id, 1);
        assert_eq!(first.used_by, Some(b));
        assert!(first.used_at.is_some());

        let second = repo.claim_prekey(a, b).await.unwrap().unwrap();
        assert_eq!(second.key_id, 2);
        assert_eq!(repo.unused_prekey_count(a).await.unwrap(), 1);

        repo.claim_prekey(a, b).await.unwrap().unwrap();
        assert!(repo.claim_prekey(a, b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_prekey_id_is_ignored() {
        let (repo, a, _) = setup().await;
        repo.upsert_prekey(a, 7, &[1; 32]).await.unwrap();
        repo.upsert_prekey(a, 7, &[2; 32]).await.unwrap();
        assert_eq!(repo.unused_prekey_count(a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_log_counts_trailing_hour() {
        let (repo, a, b) = setup().await;
        repo.log_fetch(a, b, "127.0.0.1", "test-agent").await.unwrap();
        repo.log_fetch(a, b, "127.0.0.1", "test-agent").await.unwrap();
        assert_eq!(repo.fetches_in_last_hour(a).await.unwrap(), 2);
        assert_eq!(repo.fetches_in_last_hour(b).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ratchet_blob_round_trips_opaquely() {
        let (repo, a, b) = setup().await;
        repo.store_ratchet_session(a, b, b"opaque-state-1").await.unwrap();
        repo.store_ratchet_session(a, b, b"opaque-state-2").await.unwrap();
        assert_eq!(repo.ratchet_session(a, b).await.unwrap().unwrap(), b"opaque-state-2");
        // Direction matters: (owner, peer) is not symmetric.
        assert!(repo.ratchet_session(b, a).await.unwrap().is_none());
        repo.delete_ratchet_session(a, b).await.unwrap();
        assert!(repo.ratchet_session(a, b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotate_requires_existing_bundle() {
        let (repo, a, _) = setup().await;
        assert!(repo.rotate_signed_prekey(a, &[1; 32], &[2; 64], 5, 0).await.is_err());
        repo.upsert_bundle(&bundle(a, 1)).await.unwrap();
        repo.rotate_signed_prekey(a, &[9; 32], &[8; 64], 5, 123).await.unwrap();
        let stored = repo.bundle(a).await.unwrap().unwrap();
        assert_eq!(stored.signed_prekey, vec![9; 32]);
        assert_eq!(stored.signed_prekey_id, 5);
    }
}
