//! Call rows, participants, and ICE server vending.

use {sqlx::SqlitePool, uuid::Uuid};

use {
    crate::{
        Result, StoreError,
        conversations::parse_uuid,
        types::{Call, CallParticipant, CallStatus, IceServer},
    },
    sotto_common::time::{from_ms, now_ms},
};

#[derive(sqlx::FromRow)]
struct CallRow {
    id: String,
    conversation_id: String,
    initiator_id: i64,
    call_type: String,
    status: String,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    duration: i64,
}

impl TryFrom<CallRow> for Call {
    type Error = StoreError;

    fn try_from(r: CallRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&r.id)?,
            conversation_id: parse_uuid(&r.conversation_id)?,
            initiator_id: r.initiator_id,
            call_type: r.call_type,
            status: CallStatus::parse(&r.status)
                .ok_or_else(|| StoreError::validation(format!("bad call status {}", r.status)))?,
            created_at: from_ms(r.created_at),
            started_at: r.started_at.map(from_ms),
            ended_at: r.ended_at.map(from_ms),
            duration: r.duration,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CallParticipantRow {
    call_id: String,
    user_id: i64,
    joined_at: Option<i64>,
    left_at: Option<i64>,
    is_muted: i64,
    is_video_enabled: i64,
    is_speaker_on: i64,
}

impl TryFrom<CallParticipantRow> for CallParticipant {
    type Error = StoreError;

    fn try_from(r: CallParticipantRow) -> Result<Self> {
        Ok(Self {
            call_id: parse_uuid(&r.call_id)?,
            user_id: r.user_id,
            joined_at: r.joined_at.map(from_ms),
            left_at: r.left_at.map(from_ms),
            is_muted: r.is_muted != 0,
            is_video_enabled: r.is_video_enabled != 0,
            is_speaker_on: r.is_speaker_on != 0,
        })
    }
}

#[derive(Clone)]
pub struct CallRepo {
    pool: SqlitePool,
}

impl CallRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        conversation_id: Uuid,
        initiator_id: i64,
        call_type: &str,
    ) -> Result<Call> {
        let id = Uuid::new_v4();
        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO calls (id, conversation_id, initiator_id, call_type, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(initiator_id)
        .bind(call_type)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(initiator_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.by_id(id).await
    }

    pub async fn by_id(&self, id: Uuid) -> Result<Call> {
        sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(StoreError::NotFound("call"))
    }

    /// ringing → ongoing; stamps started_at and joins the callee.
    pub async fn accept(&self, id: Uuid, callee_id: i64) -> Result<Call> {
        let now = now_ms();
        let updated = sqlx::query(
            "UPDATE calls SET status = 'ongoing', started_at = ? WHERE id = ? AND status = 'ringing'",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::Conflict("call is not ringing"));
        }
        self.upsert_participant(id, callee_id).await?;
        self.by_id(id).await
    }

    /// ringing → rejected | busy.
    pub async fn reject(&self, id: Uuid, busy: bool) -> Result<Call> {
        let status = if busy { CallStatus::Busy } else { CallStatus::Rejected };
        let updated = sqlx::query(
            "UPDATE calls SET status = ?, ended_at = ? WHERE id = ? AND status = 'ringing'",
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::Conflict("call is not ringing"));
        }
        self.by_id(id).await
    }

    /// Any live state → ended. Duration is seconds between started_at and
    /// now, or 0 when the call never connected. Remaining participants get
    /// left_at stamped.
    pub async fn end(&self, id: Uuid) -> Result<Call> {
        let call = self.by_id(id).await?;
        if call.status.is_terminal() {
            return Ok(call);
        }
        let now = now_ms();
        let duration = call
            .started_at
            .map_or(0, |started| (now - started.timestamp_millis()) / 1000);

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE calls SET status = 'ended', ended_at = ?, duration = ? WHERE id = ?")
            .bind(now)
            .bind(duration)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE call_participants SET left_at = ? WHERE call_id = ? AND left_at IS NULL")
            .bind(now)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.by_id(id).await
    }

    /// Transition a still-ringing call to `missed`; the server-owned 45 s
    /// timer and the sweeper both land here, so the claim must be atomic.
    pub async fn mark_missed(&self, id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE calls SET status = 'missed', ended_at = ? WHERE id = ? AND status = 'ringing'",
        )
        .bind(now_ms())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Ids of calls ringing longer than `older_than_secs`, for the sweeper.
    pub async fn stale_ringing(&self, older_than_secs: i64) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM calls WHERE status = 'ringing' AND created_at < ?",
        )
        .bind(now_ms() - older_than_secs * 1000)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|(id,)| parse_uuid(id)).collect()
    }

    // ── Participants ────────────────────────────────────────────────────

    pub async fn upsert_participant(&self, call_id: Uuid, user_id: i64) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO call_participants (call_id, user_id, joined_at) VALUES (?, ?, ?)
               ON CONFLICT(call_id, user_id) DO UPDATE SET joined_at = excluded.joined_at, left_at = NULL"#,
        )
        .bind(call_id.to_string())
        .bind(user_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn participant(&self, call_id: Uuid, user_id: i64) -> Result<Option<CallParticipant>> {
        sqlx::query_as::<_, CallParticipantRow>(
            "SELECT * FROM call_participants WHERE call_id = ? AND user_id = ?",
        )
        .bind(call_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .map(TryInto::try_into)
        .transpose()
    }

    pub async fn set_flag(&self, call_id: Uuid, user_id: i64, flag: &str, value: bool) -> Result<CallParticipant> {
        let column = match flag {
            "mute" => "is_muted",
            "video" => "is_video_enabled",
            "speaker" => "is_speaker_on",
            other => return Err(StoreError::validation(format!("unknown toggle {other}"))),
        };
        sqlx::query(&format!(
            "UPDATE call_participants SET {column} = ? WHERE call_id = ? AND user_id = ?"
        ))
        .bind(i64::from(value))
        .bind(call_id.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.participant(call_id, user_id)
            .await?
            .ok_or(StoreError::NotFound("call participant"))
    }

    // ── ICE servers ─────────────────────────────────────────────────────

    /// Active ICE servers; two Google STUN defaults when none configured.
    pub async fn ice_servers(&self) -> Result<Vec<IceServer>> {
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT urls, username, credential FROM ice_servers WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(vec![
                IceServer {
                    urls: vec!["stun:stun.l.google.com:19302".into()],
                    username: None,
                    credential: None,
                },
                IceServer {
                    urls: vec!["stun:stun1.l.google.com:19302".into()],
                    username: None,
                    credential: None,
                },
            ]);
        }

        Ok(rows
            .into_iter()
            .map(|(urls, username, credential)| IceServer {
                urls: serde_json::from_str(&urls).unwrap_or_else(|_| vec![urls]),
                username,
                credential,
            })
            .collect())
    }
}
