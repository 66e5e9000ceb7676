//! WebSocket wire protocol for the realtime fabric.
//!
//! All frames are JSON. Inbound frames carry an `action` discriminator and
//! deserialize into [`ClientAction`]; outbound frames carry a `type`
//! discriminator and serialize from [`ServerEvent`]. Both are closed sum
//! types — an unknown inbound action fails deserialization and is answered
//! with an [`ErrorFrame`] on the same socket.

use {
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
    uuid::Uuid,
};

pub mod topics;

// ── Constants ────────────────────────────────────────────────────────────────

/// Maximum inbound WS frame size.
pub const MAX_PAYLOAD_BYTES: usize = 262_144; // 256 KB
/// Per-subscriber topic queue depth before overflow dropping kicks in.
pub const TOPIC_QUEUE_CAPACITY: usize = 1_024;
/// Message edits are refused after this many seconds.
pub const EDIT_WINDOW_SECS: i64 = 900;
/// Ringing calls auto-transition to `missed` after this many seconds.
pub const CALL_RING_TIMEOUT_SECS: u64 = 45;
/// Duplicate-notification suppression window.
pub const PUSH_THROTTLE_WINDOW_SECS: u64 = 30;
/// Message history page size.
pub const MESSAGE_PAGE_SIZE: i64 = 50;
/// Upper bound on one-time prekeys accepted per replenish call.
pub const MAX_PREKEYS_PER_REPLENISH: usize = 200;
/// Bundle fetches per requester per hour before an excessive-fetch alert.
pub const FETCH_ALERT_THRESHOLD: i64 = 50;
/// Encrypted media upload cap.
pub const MAX_FILE_BYTES: usize = 100 * 1024 * 1024;
/// Encrypted thumbnail cap.
pub const MAX_THUMBNAIL_BYTES: usize = 512 * 1024;

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    /// Missing, invalid, or expired bearer token.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Authenticated but not allowed on this endpoint.
    pub const FORBIDDEN: u16 = 4003;
}

// ── Inbound frames ───────────────────────────────────────────────────────────

/// Client → server frame, demultiplexed on `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    SendMessage(SendMessage),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
    ReadReceipt(StatusReceipt),
    Delivered(StatusReceipt),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    React(Reaction),
    InitiateCall(InitiateCall),
    AcceptCall(CallRef),
    RejectCall(RejectCall),
    Offer(SdpRelay),
    Answer(SdpRelay),
    IceCandidate(IceRelay),
    EndCall(CallRef),
    ToggleMute(ToggleFlag),
    ToggleVideo(ToggleFlag),
    ToggleSpeaker(ToggleFlag),
}

impl ClientAction {
    /// The `action` string this frame arrived under, for error echo frames.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "send_message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
            Self::ReadReceipt(_) => "read_receipt",
            Self::Delivered(_) => "delivered",
            Self::EditMessage(_) => "edit_message",
            Self::DeleteMessage(_) => "delete_message",
            Self::React(_) => "react",
            Self::InitiateCall(_) => "initiate_call",
            Self::AcceptCall(_) => "accept_call",
            Self::RejectCall(_) => "reject_call",
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::EndCall(_) => "end_call",
            Self::ToggleMute(_) => "toggle_mute",
            Self::ToggleVideo(_) => "toggle_video",
            Self::ToggleSpeaker(_) => "toggle_speaker",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub conversation_id: Uuid,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Base64 ciphertext; opaque to the server, may be empty.
    #[serde(default)]
    pub content_encrypted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_file_key: Option<String>,
    /// Per-recipient file keys for group media fan-out (user id → key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_file_keys: Option<HashMap<i64, String>>,
    /// Per-recipient envelopes for group text fan-out (user id → base64).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients_encrypted: Option<HashMap<i64, String>>,
}

fn default_message_type() -> String {
    "text".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub is_recording: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReceipt {
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessage {
    pub message_id: Uuid,
    pub content_encrypted: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub message_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub message_id: Uuid,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub remove: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateCall {
    pub conversation_id: Uuid,
    #[serde(default = "default_call_type")]
    pub call_type: String,
}

fn default_call_type() -> String {
    "audio".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRef {
    pub call_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectCall {
    pub call_id: Uuid,
    #[serde(default)]
    pub busy: bool,
}

/// Opaque SDP forwarding; the server never inspects `sdp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpRelay {
    pub call_id: Uuid,
    pub target_user_id: i64,
    pub sdp: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceRelay {
    pub call_id: Uuid,
    pub target_user_id: i64,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleFlag {
    pub call_id: Uuid,
    pub enabled: bool,
}

// ── Outbound frames ──────────────────────────────────────────────────────────

/// Server → client frame, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "chat.message")]
    ChatMessage(MessageWire),
    #[serde(rename = "typing.indicator")]
    TypingIndicator(TypingWire),
    #[serde(rename = "status.update")]
    StatusUpdate(StatusUpdateWire),
    #[serde(rename = "message.edited")]
    MessageEdited(MessageEditedWire),
    #[serde(rename = "message.deleted")]
    MessageDeleted(MessageDeletedWire),
    #[serde(rename = "message.reaction")]
    MessageReaction(ReactionWire),
    #[serde(rename = "presence.update")]
    PresenceUpdate(PresenceWire),
    #[serde(rename = "call.initiated")]
    CallInitiated(CallStateWire),
    #[serde(rename = "call.incoming")]
    CallIncoming(CallStateWire),
    #[serde(rename = "call.accepted")]
    CallAccepted(CallStateWire),
    #[serde(rename = "call.rejected")]
    CallRejected(CallStateWire),
    #[serde(rename = "call.offer")]
    CallOffer(SdpWire),
    #[serde(rename = "call.answer")]
    CallAnswer(SdpWire),
    #[serde(rename = "call.ice_candidate")]
    CallIceCandidate(IceWire),
    #[serde(rename = "call.ended")]
    CallEnded(CallEndedWire),
    #[serde(rename = "call.participant_update")]
    CallParticipantUpdate(ParticipantUpdateWire),
    #[serde(rename = "security.alert")]
    SecurityAlert(SecurityAlertWire),
}

impl ServerEvent {
    /// The `type` tag this event serializes under.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage(_) => "chat.message",
            Self::TypingIndicator(_) => "typing.indicator",
            Self::StatusUpdate(_) => "status.update",
            Self::MessageEdited(_) => "message.edited",
            Self::MessageDeleted(_) => "message.deleted",
            Self::MessageReaction(_) => "message.reaction",
            Self::PresenceUpdate(_) => "presence.update",
            Self::CallInitiated(_) => "call.initiated",
            Self::CallIncoming(_) => "call.incoming",
            Self::CallAccepted(_) => "call.accepted",
            Self::CallRejected(_) => "call.rejected",
            Self::CallOffer(_) => "call.offer",
            Self::CallAnswer(_) => "call.answer",
            Self::CallIceCandidate(_) => "call.ice_candidate",
            Self::CallEnded(_) => "call.ended",
            Self::CallParticipantUpdate(_) => "call.participant_update",
            Self::SecurityAlert(_) => "security.alert",
        }
    }

    /// Events that must survive queue overflow (never the drop victim).
    #[must_use]
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::CallInitiated(_)
                | Self::CallIncoming(_)
                | Self::CallAccepted(_)
                | Self::CallRejected(_)
                | Self::CallOffer(_)
                | Self::CallAnswer(_)
                | Self::CallIceCandidate(_)
                | Self::CallEnded(_)
                | Self::SecurityAlert(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWire {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: i64,
    pub message_type: String,
    /// Base64. For group fan-out this is the receiving user's envelope only.
    pub content_encrypted: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_file_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingWire {
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub is_typing: bool,
    #[serde(default)]
    pub is_recording: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateWire {
    pub message_ids: Vec<Uuid>,
    pub user_id: i64,
    /// `delivered` or `read`.
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEditedWire {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub content_encrypted: String,
    pub edited_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeletedWire {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionWire {
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: i64,
    pub emoji: String,
    /// `add` or `remove`.
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceWire {
    pub user_id: i64,
    pub online: bool,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerWire {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStateWire {
    pub call_id: Uuid,
    pub conversation_id: Uuid,
    pub call_type: String,
    pub status: String,
    pub initiator_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServerWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpWire {
    pub call_id: Uuid,
    pub from_user_id: i64,
    pub sdp: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceWire {
    pub call_id: Uuid,
    pub from_user_id: i64,
    pub candidate: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEndedWire {
    pub call_id: Uuid,
    pub ended_by: i64,
    pub duration_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantUpdateWire {
    pub call_id: Uuid,
    pub user_id: i64,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_speaker_on: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAlertWire {
    pub alert_type: String,
    pub severity: String,
    pub message: String,
}

/// Error reply on the same socket; the connection stays open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl ErrorFrame {
    #[must_use]
    pub fn new(error: impl Into<String>, action: Option<&str>) -> Self {
        Self {
            error: error.into(),
            action: action.map(str::to_owned),
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_discriminator_round_trips() {
        let frame = serde_json::json!({
            "action": "send_message",
            "conversation_id": "6a1f0d62-58f1-4c07-9176-5ba4f47f1e0b",
            "message_type": "text",
            "content_encrypted": "aGVsbG8=",
        });
        let parsed: ClientAction = serde_json::from_value(frame).unwrap();
        assert_eq!(parsed.name(), "send_message");
        match parsed {
            ClientAction::SendMessage(m) => assert_eq!(m.content_encrypted, "aGVsbG8="),
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        let frame = serde_json::json!({ "action": "fly_to_moon" });
        assert!(serde_json::from_value::<ClientAction>(frame).is_err());
    }

    #[test]
    fn server_event_uses_dotted_type_tags() {
        let event = ServerEvent::MessageDeleted(MessageDeletedWire {
            message_id: Uuid::nil(),
            conversation_id: Uuid::nil(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message.deleted");
    }

    #[test]
    fn call_events_are_critical() {
        let event = ServerEvent::CallIncoming(CallStateWire {
            call_id: Uuid::nil(),
            conversation_id: Uuid::nil(),
            call_type: "audio".into(),
            status: "ringing".into(),
            initiator_id: 1,
            from_user_id: None,
            ice_servers: vec![],
        });
        assert!(event.is_critical());

        let event = ServerEvent::TypingIndicator(TypingWire {
            conversation_id: Uuid::nil(),
            user_id: 1,
            is_typing: true,
            is_recording: false,
        });
        assert!(!event.is_critical());
    }
}
