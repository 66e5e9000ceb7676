//! Domain types backing the relational rows.
//!
//! Enum values serialize as lowercase strings everywhere (DB and wire).

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    uuid::Uuid,
};

// ── Users ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub is_verified: bool,
    pub lock_pin_hash: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Conversations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Private,
    Group,
    Secret,
}

impl ConversationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Secret => "secret",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            "secret" => Some(Self::Secret),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub conv_type: ConversationType,
    pub only_admins_can_send: bool,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub role: String,
    pub unread_count: i64,
    pub muted_until: Option<DateTime<Utc>>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub is_hidden: bool,
    pub is_locked: bool,
    pub is_favorite: bool,
    pub is_blocked: bool,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl Participant {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }

    /// Muted forever (NULL) or until a future instant.
    #[must_use]
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        match self.muted_until {
            Some(until) => until > now,
            None => false,
        }
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: i64,
    pub message_type: String,
    /// Raw ciphertext; empty once tombstoned.
    pub content: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_to_id: Option<Uuid>,
    pub forwarded_from_id: Option<Uuid>,
    pub attachment_id: Option<Uuid>,
    pub encrypted_file_key: Option<String>,
}

/// Delivery status lattice: sent < delivered < read. Upserts never move a
/// row backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

// ── Calls ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Rejected,
    Busy,
    Missed,
    Failed,
}

impl CallStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Ongoing => "ongoing",
            Self::Ended => "ended",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(Self::Ringing),
            "ongoing" => Some(Self::Ongoing),
            "ended" => Some(Self::Ended),
            "rejected" => Some(Self::Rejected),
            "busy" => Some(Self::Busy),
            "missed" => Some(Self::Missed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Ringing | Self::Ongoing)
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub initiator_id: i64,
    pub call_type: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: i64,
}

#[derive(Debug, Clone)]
pub struct CallParticipant {
    pub call_id: Uuid,
    pub user_id: i64,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_speaker_on: bool,
}

#[derive(Debug, Clone)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

// ── Keys ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KeyBundle {
    pub user_id: i64,
    pub crypto_version: u8,
    pub identity_key: Vec<u8>,
    pub identity_dh_key: Vec<u8>,
    pub signed_prekey: Vec<u8>,
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_id: i64,
    pub signed_prekey_timestamp: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OneTimePrekey {
    pub user_id: i64,
    pub key_id: i64,
    pub public_key: Vec<u8>,
    pub is_used: bool,
    pub used_by: Option<i64>,
    pub used_at: Option<DateTime<Utc>>,
}

// ── Notifications ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: i64,
    pub sender_id: Option<i64>,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub is_read: bool,
    pub fcm_sent: bool,
    pub fcm_message_id: Option<String>,
    pub fcm_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub user_id: i64,
    pub new_message: bool,
    pub message_reaction: bool,
    pub mention: bool,
    pub incoming_call: bool,
    pub missed_call: bool,
    pub group_invite: bool,
    pub channel_post: bool,
    pub security_alert: bool,
    pub dnd_enabled: bool,
    /// `HH:MM` local time; the window may wrap past midnight.
    pub dnd_start: Option<String>,
    pub dnd_end: Option<String>,
    pub show_preview: bool,
    pub sound_enabled: bool,
    pub vibration_enabled: bool,
}

impl NotificationPreferences {
    /// All toggles on, DND off — the row auto-created on first dispatch.
    #[must_use]
    pub fn defaults(user_id: i64) -> Self {
        Self {
            user_id,
            new_message: true,
            message_reaction: true,
            mention: true,
            incoming_call: true,
            missed_call: true,
            group_invite: true,
            channel_post: true,
            security_alert: true,
            dnd_enabled: false,
            dnd_start: None,
            dnd_end: None,
            show_preview: true,
            sound_enabled: true,
            vibration_enabled: true,
        }
    }

    /// Whether a notification type passes the per-type toggle.
    #[must_use]
    pub fn allows(&self, notification_type: &str) -> bool {
        match notification_type {
            "new_message" => self.new_message,
            "message_reaction" => self.message_reaction,
            "mention" => self.mention,
            "incoming_call" => self.incoming_call,
            "missed_call" => self.missed_call,
            "group_invite" => self.group_invite,
            "channel_post" => self.channel_post,
            "security_alert" => self.security_alert,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceToken {
    pub user_id: i64,
    pub device_id: String,
    pub token: String,
    pub platform: String,
    pub is_active: bool,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SecurityAlert {
    pub id: i64,
    pub user_id: i64,
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_lattice_orders() {
        assert!(DeliveryStatus::Sent < DeliveryStatus::Delivered);
        assert!(DeliveryStatus::Delivered < DeliveryStatus::Read);
    }

    #[test]
    fn mute_forever_is_null() {
        let mut p = Participant {
            conversation_id: Uuid::nil(),
            user_id: 1,
            role: "member".into(),
            unread_count: 0,
            muted_until: None,
            cleared_at: None,
            is_hidden: false,
            is_locked: false,
            is_favorite: false,
            is_blocked: false,
            last_read_at: None,
        };
        // A participant row with no mute entry is not muted...
        assert!(!p.is_muted(Utc::now()));
        // ...and a past expiry unmutes.
        p.muted_until = Some(Utc::now() - chrono::Duration::seconds(5));
        assert!(!p.is_muted(Utc::now()));
        p.muted_until = Some(Utc::now() + chrono::Duration::seconds(5));
        assert!(p.is_muted(Utc::now()));
    }

    #[test]
    fn call_terminal_states() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Ongoing.is_terminal());
        for s in [
            CallStatus::Ended,
            CallStatus::Rejected,
            CallStatus::Busy,
            CallStatus::Missed,
            CallStatus::Failed,
        ] {
            assert!(s.is_terminal());
        }
    }
}
