//! The message pipeline: persist → multiplex to subscribers → side-effects
//! (unread counts, delivery statuses, push).
//!
//! `send_message` is the heart: authorize, persist, link, fan out, and hand
//! offline recipients to the push dispatcher. Group messages with
//! per-recipient envelopes publish one event per recipient carrying only
//! that recipient's ciphertext.

use std::sync::Arc;

use {
    base64::Engine,
    tracing::{debug, warn},
    uuid::Uuid,
};

use {
    sotto_bus::TopicBus,
    sotto_protocol::{
        EDIT_WINDOW_SECS, EditMessage, MessageDeletedWire, MessageEditedWire, MessageWire,
        Reaction, ReactionWire, SendMessage, ServerEvent, StatusUpdateWire, TypingWire, topics,
    },
    sotto_push::{PushRequest, PushService},
    sotto_storage::{
        Result, StoreError,
        attachments::AttachmentRepo,
        conversations::ConversationRepo,
        messages::{MessageRepo, NewMessage},
        types::{ConversationType, DeliveryStatus, Message},
        users::UserRepo,
    },
    sotto_common::time::to_rfc3339,
};

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

pub struct ChatService {
    messages: MessageRepo,
    conversations: ConversationRepo,
    users: UserRepo,
    attachments: AttachmentRepo,
    bus: Arc<TopicBus>,
    push: Arc<PushService>,
}

impl ChatService {
    pub fn new(pool: sqlx::SqlitePool, bus: Arc<TopicBus>, push: Arc<PushService>) -> Arc<Self> {
        Arc::new(Self {
            messages: MessageRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool.clone()),
            users: UserRepo::new(pool.clone()),
            attachments: AttachmentRepo::new(pool),
            bus,
            push,
        })
    }

    fn wire(
        message: &Message,
        content_override: Option<String>,
        file_key_override: Option<String>,
    ) -> MessageWire {
        MessageWire {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            message_type: message.message_type.clone(),
            content_encrypted: content_override
                .unwrap_or_else(|| b64().encode(&message.content)),
            created_at: to_rfc3339(message.created_at),
            reply_to_id: message.reply_to_id,
            attachment_id: message.attachment_id,
            encrypted_file_key: file_key_override.or_else(|| message.encrypted_file_key.clone()),
        }
    }

    /// The full send pipeline. Returns the sender's echo.
    pub async fn send_message(&self, sender_id: i64, input: SendMessage) -> Result<MessageWire> {
        // 1. Authorize: participant, not blocked, admin-only rooms.
        let conversation = self.conversations.by_id(input.conversation_id).await?;
        let participant = self
            .conversations
            .require_participant(input.conversation_id, sender_id)
            .await?;
        if conversation.conv_type == ConversationType::Group
            && conversation.only_admins_can_send
            && !participant.is_admin()
        {
            return Err(StoreError::Forbidden("only admins can send here"));
        }

        let content = b64()
            .decode(&input.content_encrypted)
            .map_err(|_| StoreError::validation("content_encrypted is not valid base64"))?;

        // Reply target must live in the same conversation and be intact.
        if let Some(reply_to) = input.reply_to_id {
            let target = self.messages.by_id(reply_to).await?;
            if target.conversation_id != input.conversation_id || target.is_deleted {
                return Err(StoreError::validation("reply target is not addressable"));
            }
        }

        // 2. Persist.
        let message = self
            .messages
            .insert(NewMessage {
                conversation_id: input.conversation_id,
                sender_id,
                message_type: input.message_type.clone(),
                content,
                reply_to_id: input.reply_to_id,
                forwarded_from_id: None,
                attachment_id: input.attachment_id,
                encrypted_file_key: input.encrypted_file_key.clone(),
            })
            .await?;

        // 3. Link attachment; a failed claim is non-fatal.
        if let Some(attachment_id) = input.attachment_id {
            match self
                .attachments
                .link_to_message(attachment_id, message.id, sender_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(message_id = %message.id, attachment_id = %attachment_id, "attachment link refused");
                }
                Err(e) => warn!(error = %e, "attachment link failed"),
            }
        }

        // 4. Per-recipient envelopes.
        let mut envelopes = std::collections::HashMap::new();
        if let Some(recipients) = &input.recipients_encrypted {
            for (user_id, ciphertext_b64) in recipients {
                match b64().decode(ciphertext_b64) {
                    Ok(ciphertext) => {
                        envelopes.insert(*user_id, ciphertext);
                    }
                    Err(_) => warn!(user_id, "discarding malformed recipient envelope"),
                }
            }
            if !envelopes.is_empty() {
                self.messages.insert_recipients(message.id, &envelopes).await?;
            }
        }

        // 5. Sender's own status row.
        self.messages
            .upsert_status(message.id, sender_id, DeliveryStatus::Sent)
            .await?;

        // 6–7. Conversation index and unread counters.
        self.conversations
            .set_last_message(input.conversation_id, message.id)
            .await?;
        self.conversations
            .increment_unread(input.conversation_id, sender_id)
            .await?;

        // 8. Publish.
        if envelopes.is_empty() {
            let event = ServerEvent::ChatMessage(Self::wire(&message, None, None));
            self.bus
                .publish(&topics::conversation(input.conversation_id), &event)
                .await
                .ok();
        } else {
            // One event per recipient; nobody sees another's envelope or
            // wrapped file key.
            for (recipient, ciphertext) in &envelopes {
                let file_key = input
                    .encrypted_file_keys
                    .as_ref()
                    .and_then(|keys| keys.get(recipient).cloned());
                let event = ServerEvent::ChatMessage(Self::wire(
                    &message,
                    Some(b64().encode(ciphertext)),
                    file_key,
                ));
                self.bus.publish(&topics::user(*recipient), &event).await.ok();
            }
        }

        // 9. Push for offline, non-muted participants.
        self.enqueue_pushes(&message).await?;

        debug!(message_id = %message.id, conversation_id = %message.conversation_id, "message sent");
        Ok(Self::wire(&message, None, None))
    }

    async fn enqueue_pushes(&self, message: &Message) -> Result<()> {
        let sender_name = self
            .users
            .by_id(message.sender_id)
            .await
            .map(|u| u.username)
            .unwrap_or_else(|_| "Someone".into());

        for participant in self.conversations.participants(message.conversation_id).await? {
            if participant.user_id == message.sender_id {
                continue;
            }
            if participant.is_muted(chrono::Utc::now()) {
                continue;
            }
            let recipient = match self.users.by_id(participant.user_id).await {
                Ok(user) => user,
                Err(_) => continue,
            };
            if recipient.is_online {
                continue;
            }
            let push = PushRequest {
                recipient_id: participant.user_id,
                notification_type: "new_message".into(),
                title: sender_name.clone(),
                // Ciphertext only; the preview is the client's call.
                body: "New message".into(),
                data: serde_json::json!({
                    "conversation_id": message.conversation_id.to_string(),
                    "message_id": message.id.to_string(),
                }),
                sender_id: Some(message.sender_id),
                source_type: Some("conversation".into()),
                source_id: Some(message.conversation_id.to_string()),
                target_type: Some("conversation".into()),
                target_id: Some(message.conversation_id.to_string()),
                high_priority: false,
            };
            if let Err(e) = self.push.send(push).await {
                warn!(error = %e, "push enqueue failed");
            }
        }
        Ok(())
    }

    /// Transient typing indicator; never persisted.
    pub async fn typing(
        &self,
        user_id: i64,
        conversation_id: Uuid,
        is_typing: bool,
        is_recording: bool,
    ) -> Result<()> {
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;
        let event = ServerEvent::TypingIndicator(TypingWire {
            conversation_id,
            user_id,
            is_typing,
            is_recording,
        });
        self.bus
            .publish(&topics::conversation(conversation_id), &event)
            .await
            .ok();
        Ok(())
    }

    /// Delivered/read receipts: upsert on the lattice, then tell each
    /// affected sender on their personal topic.
    pub async fn update_statuses(
        &self,
        user_id: i64,
        message_ids: &[Uuid],
        status: DeliveryStatus,
    ) -> Result<()> {
        let mut by_sender: std::collections::HashMap<i64, Vec<Uuid>> =
            std::collections::HashMap::new();
        for message_id in message_ids {
            let message = match self.messages.by_id(*message_id).await {
                Ok(m) => m,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if message.sender_id == user_id {
                continue;
            }
            // Receipts only come from participants.
            if self
                .conversations
                .participant(message.conversation_id, user_id)
                .await?
                .is_none()
            {
                continue;
            }
            if self.messages.upsert_status(*message_id, user_id, status).await? {
                by_sender.entry(message.sender_id).or_default().push(*message_id);
            }
        }

        for (sender_id, ids) in by_sender {
            let event = ServerEvent::StatusUpdate(StatusUpdateWire {
                message_ids: ids,
                user_id,
                status: status.as_str().to_string(),
            });
            self.bus.publish(&topics::user(sender_id), &event).await.ok();
        }
        Ok(())
    }

    /// Reset unread, backfill read rows, notify each sender once.
    pub async fn mark_as_read(&self, user_id: i64, conversation_id: Uuid) -> Result<()> {
        self.conversations
            .require_participant(conversation_id, user_id)
            .await?;
        self.conversations.reset_unread(conversation_id, user_id).await?;

        let backfill = self.messages.mark_conversation_read(conversation_id, user_id).await?;
        for (sender_id, ids) in backfill.by_sender {
            let event = ServerEvent::StatusUpdate(StatusUpdateWire {
                message_ids: ids,
                user_id,
                status: DeliveryStatus::Read.as_str().to_string(),
            });
            self.bus.publish(&topics::user(sender_id), &event).await.ok();
        }
        Ok(())
    }

    /// Sender-only, inside the edit window.
    pub async fn edit_message(&self, user_id: i64, input: EditMessage) -> Result<MessageWire> {
        let content = b64()
            .decode(&input.content_encrypted)
            .map_err(|_| StoreError::validation("content_encrypted is not valid base64"))?;
        let message = self
            .messages
            .edit(input.message_id, user_id, &content, EDIT_WINDOW_SECS)
            .await?;

        let event = ServerEvent::MessageEdited(MessageEditedWire {
            message_id: message.id,
            conversation_id: message.conversation_id,
            content_encrypted: input.content_encrypted.clone(),
            edited_at: message.edited_at.map(to_rfc3339).unwrap_or_default(),
        });
        self.bus
            .publish(&topics::conversation(message.conversation_id), &event)
            .await
            .ok();
        Ok(Self::wire(&message, None, None))
    }

    /// Soft tombstone plus `message.deleted` to the room.
    pub async fn delete_message(&self, user_id: i64, message_id: Uuid) -> Result<()> {
        let message = self.messages.soft_delete(message_id, user_id).await?;
        let event = ServerEvent::MessageDeleted(MessageDeletedWire {
            message_id,
            conversation_id: message.conversation_id,
        });
        self.bus
            .publish(&topics::conversation(message.conversation_id), &event)
            .await
            .ok();
        Ok(())
    }

    /// Toggle a reaction and announce the transition.
    pub async fn react(&self, user_id: i64, input: Reaction) -> Result<()> {
        let message = self.messages.by_id(input.message_id).await?;
        self.conversations
            .require_participant(message.conversation_id, user_id)
            .await?;
        if !input.remove && input.emoji.is_empty() {
            return Err(StoreError::validation("emoji is required"));
        }

        let action = self
            .messages
            .toggle_reaction(input.message_id, user_id, &input.emoji, input.remove)
            .await?;
        let event = ServerEvent::MessageReaction(ReactionWire {
            message_id: input.message_id,
            conversation_id: message.conversation_id,
            user_id,
            emoji: input.emoji,
            action: action.to_string(),
        });
        self.bus
            .publish(&topics::conversation(message.conversation_id), &event)
            .await
            .ok();
        Ok(())
    }
}
