//! Call signaling: the ringing → ongoing → ended state machine, SDP/ICE
//! relay, and the server-owned missed-call timer.
//!
//! SDP offers, answers, and ICE candidates are forwarded opaquely — the
//! server never inspects payloads, it only stamps `from_user_id` and
//! routes to the target's personal topic.

use std::sync::Arc;

use {
    tokio::time::Duration,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use {
    sotto_bus::TopicBus,
    sotto_protocol::{
        CALL_RING_TIMEOUT_SECS, CallEndedWire, CallStateWire, IceServerWire, IceWire,
        ParticipantUpdateWire, SdpRelay, SdpWire, ServerEvent, topics,
    },
    sotto_push::{PushRequest, PushService},
    sotto_storage::{
        Result, StoreError,
        calls::CallRepo,
        conversations::ConversationRepo,
        types::Call,
    },
};

pub struct CallService {
    calls: CallRepo,
    conversations: ConversationRepo,
    bus: Arc<TopicBus>,
    push: Arc<PushService>,
    ring_timeout: Duration,
}

impl CallService {
    pub fn new(
        pool: sqlx::SqlitePool,
        bus: Arc<TopicBus>,
        push: Arc<PushService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: CallRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool),
            bus,
            push,
            ring_timeout: Duration::from_secs(CALL_RING_TIMEOUT_SECS),
        })
    }

    /// Shorter timer for tests.
    pub fn with_ring_timeout(
        pool: sqlx::SqlitePool,
        bus: Arc<TopicBus>,
        push: Arc<PushService>,
        ring_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: CallRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool),
            bus,
            push,
            ring_timeout,
        })
    }

    async fn ice_servers(&self) -> Result<Vec<IceServerWire>> {
        Ok(self
            .calls
            .ice_servers()
            .await?
            .into_iter()
            .map(|s| IceServerWire {
                urls: s.urls,
                username: s.username,
                credential: s.credential,
            })
            .collect())
    }

    fn state_wire(call: &Call, from_user_id: Option<i64>, ice: Vec<IceServerWire>) -> CallStateWire {
        CallStateWire {
            call_id: call.id,
            conversation_id: call.conversation_id,
            call_type: call.call_type.clone(),
            status: call.status.as_str().to_string(),
            initiator_id: call.initiator_id,
            from_user_id,
            ice_servers: ice,
        }
    }

    /// Create the call, ring every other participant, arm the missed timer.
    /// The returned wire (with ICE) is the `call.initiated` reply for the
    /// initiator's own socket.
    pub async fn initiate(
        self: &Arc<Self>,
        conversation_id: Uuid,
        initiator_id: i64,
        call_type: &str,
    ) -> Result<CallStateWire> {
        if !matches!(call_type, "audio" | "video") {
            return Err(StoreError::validation(format!("unknown call type {call_type}")));
        }
        self.conversations
            .require_participant(conversation_id, initiator_id)
            .await?;

        let call = self.calls.create(conversation_id, initiator_id, call_type).await?;
        info!(call_id = %call.id, initiator_id, call_type, "call: ringing");

        let ice = self.ice_servers().await?;
        let incoming = ServerEvent::CallIncoming(Self::state_wire(
            &call,
            Some(initiator_id),
            ice.clone(),
        ));

        let participant_ids = self.conversations.participant_ids(conversation_id).await?;
        for participant in participant_ids.iter().filter(|id| **id != initiator_id) {
            if let Err(e) = self.bus.publish(&topics::user(*participant), &incoming).await {
                warn!(error = %e, "call: incoming publish failed");
            }
            let push = PushRequest {
                recipient_id: *participant,
                notification_type: "incoming_call".into(),
                title: "Incoming call".into(),
                body: format!("Incoming {call_type} call"),
                data: serde_json::json!({
                    "call_id": call.id.to_string(),
                    "conversation_id": conversation_id.to_string(),
                    "call_type": call_type,
                }),
                sender_id: Some(initiator_id),
                source_type: Some("call".into()),
                source_id: Some(call.id.to_string()),
                target_type: Some("conversation".into()),
                target_id: Some(conversation_id.to_string()),
                high_priority: true,
            };
            if let Err(e) = self.push.send(push).await {
                warn!(error = %e, "call: incoming push failed");
            }
        }

        self.arm_missed_timer(call.id);
        Ok(Self::state_wire(&call, None, ice))
    }

    /// Server-owned timer: fires even if the initiator disconnects.
    fn arm_missed_timer(self: &Arc<Self>, call_id: Uuid) {
        let service = Arc::clone(self);
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            match service.mark_missed(call_id).await {
                Ok(true) => debug!(call_id = %call_id, "call: auto-missed"),
                Ok(false) => {}
                Err(e) => warn!(call_id = %call_id, error = %e, "call: missed timer failed"),
            }
        });
    }

    /// Transition a still-ringing call to missed and notify the callees.
    /// Returns false when the call was answered or ended in the meantime.
    pub async fn mark_missed(&self, call_id: Uuid) -> Result<bool> {
        if !self.calls.mark_missed(call_id).await? {
            return Ok(false);
        }
        let call = self.calls.by_id(call_id).await?;
        let ended = ServerEvent::CallEnded(CallEndedWire {
            call_id,
            ended_by: call.initiator_id,
            duration_secs: 0,
        });
        let participant_ids = self.conversations.participant_ids(call.conversation_id).await?;
        for participant in &participant_ids {
            let _ = self.bus.publish(&topics::user(*participant), &ended).await;
            if *participant == call.initiator_id {
                continue;
            }
            let push = PushRequest {
                recipient_id: *participant,
                notification_type: "missed_call".into(),
                title: "Missed call".into(),
                body: format!("You missed a {} call", call.call_type),
                data: serde_json::json!({ "call_id": call_id.to_string() }),
                sender_id: Some(call.initiator_id),
                source_type: Some("call".into()),
                source_id: Some(call_id.to_string()),
                target_type: Some("conversation".into()),
                target_id: Some(call.conversation_id.to_string()),
                high_priority: false,
            };
            if let Err(e) = self.push.send(push).await {
                warn!(error = %e, "call: missed push failed");
            }
        }
        Ok(true)
    }

    /// ringing → ongoing. Emits `call.accepted` (with fresh ICE) to both
    /// the initiator and the responder.
    pub async fn accept(&self, call_id: Uuid, callee_id: i64) -> Result<CallStateWire> {
        let call = self.calls.by_id(call_id).await?;
        self.conversations
            .require_participant(call.conversation_id, callee_id)
            .await?;

        let call = self.calls.accept(call_id, callee_id).await?;
        let ice = self.ice_servers().await?;
        let accepted =
            ServerEvent::CallAccepted(Self::state_wire(&call, Some(callee_id), ice.clone()));
        self.bus
            .publish(&topics::user(call.initiator_id), &accepted)
            .await
            .ok();
        self.bus.publish(&topics::user(callee_id), &accepted).await.ok();
        info!(call_id = %call_id, callee_id, "call: accepted");
        Ok(Self::state_wire(&call, Some(callee_id), ice))
    }

    /// ringing → rejected | busy.
    pub async fn reject(&self, call_id: Uuid, rejecter_id: i64, busy: bool) -> Result<CallStateWire> {
        let call = self.calls.by_id(call_id).await?;
        self.conversations
            .require_participant(call.conversation_id, rejecter_id)
            .await?;

        let call = self.calls.reject(call_id, busy).await?;
        let rejected = ServerEvent::CallRejected(Self::state_wire(&call, Some(rejecter_id), vec![]));
        self.bus
            .publish(&topics::user(call.initiator_id), &rejected)
            .await
            .ok();
        Ok(Self::state_wire(&call, Some(rejecter_id), vec![]))
    }

    /// Opaque SDP forwarding to the target's personal topic.
    pub async fn relay_sdp(&self, from_user_id: i64, relay: &SdpRelay, answer: bool) -> Result<()> {
        let call = self.calls.by_id(relay.call_id).await?;
        self.conversations
            .require_participant(call.conversation_id, from_user_id)
            .await?;

        let wire = SdpWire {
            call_id: relay.call_id,
            from_user_id,
            sdp: relay.sdp.clone(),
        };
        let event = if answer {
            ServerEvent::CallAnswer(wire)
        } else {
            ServerEvent::CallOffer(wire)
        };
        self.bus
            .publish(&topics::user(relay.target_user_id), &event)
            .await
            .ok();
        Ok(())
    }

    pub async fn relay_ice(
        &self,
        from_user_id: i64,
        call_id: Uuid,
        target_user_id: i64,
        candidate: serde_json::Value,
    ) -> Result<()> {
        let call = self.calls.by_id(call_id).await?;
        self.conversations
            .require_participant(call.conversation_id, from_user_id)
            .await?;

        let event = ServerEvent::CallIceCandidate(IceWire {
            call_id,
            from_user_id,
            candidate,
        });
        self.bus.publish(&topics::user(target_user_id), &event).await.ok();
        Ok(())
    }

    /// Terminal transition; idempotent for already-ended calls.
    pub async fn end(&self, call_id: Uuid, ended_by: i64) -> Result<CallEndedWire> {
        let call = self.calls.by_id(call_id).await?;
        self.conversations
            .require_participant(call.conversation_id, ended_by)
            .await?;

        let already_terminal = call.status.is_terminal();
        let call = self.calls.end(call_id).await?;
        let wire = CallEndedWire {
            call_id,
            ended_by,
            duration_secs: call.duration,
        };
        if !already_terminal {
            let event = ServerEvent::CallEnded(wire.clone());
            self.bus.publish(&topics::call(call_id), &event).await.ok();
            // Ringing parties may not have joined the call topic yet.
            for participant in self.conversations.participant_ids(call.conversation_id).await? {
                self.bus.publish(&topics::user(participant), &event).await.ok();
            }
            info!(call_id = %call_id, ended_by, duration = call.duration, "call: ended");
        }
        Ok(wire)
    }

    /// Persist a toggle on the caller's participant row and publish the
    /// update to the call topic.
    pub async fn toggle(
        &self,
        call_id: Uuid,
        user_id: i64,
        flag: &str,
        value: bool,
    ) -> Result<ParticipantUpdateWire> {
        let participant = self.calls.set_flag(call_id, user_id, flag, value).await?;
        let wire = ParticipantUpdateWire {
            call_id,
            user_id,
            is_muted: participant.is_muted,
            is_video_enabled: participant.is_video_enabled,
            is_speaker_on: participant.is_speaker_on,
        };
        self.bus
            .publish(&topics::call(call_id), &ServerEvent::CallParticipantUpdate(wire.clone()))
            .await
            .ok();
        Ok(wire)
    }

    pub async fn call(&self, call_id: Uuid) -> Result<Call> {
        self.calls.by_id(call_id).await
    }

    /// Sweep for ringing calls the per-call timers lost (e.g. after a
    /// restart); run from the maintenance scheduler.
    pub async fn sweep_stale_ringing(&self) -> Result<usize> {
        let stale = self
            .calls
            .stale_ringing(self.ring_timeout.as_secs() as i64)
            .await?;
        let mut missed = 0;
        for call_id in stale {
            if self.mark_missed(call_id).await? {
                missed += 1;
            }
        }
        Ok(missed)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        sotto_push::fcm::RecordingFcmClient,
        sotto_storage::users::UserRepo,
        std::time::Duration as StdDuration,
    };

    async fn setup(ring_ms: u64) -> (Arc<CallService>, Arc<TopicBus>, Uuid, i64, i64) {
        let pool = sotto_storage::test_pool().await;
        let users = UserRepo::new(pool.clone());
        let a = users.create("a@example.com", "a", "h").await.unwrap().id;
        let b = users.create("b@example.com", "b", "h").await.unwrap().id;
        let conv = ConversationRepo::new(pool.clone())
            .open_private(a, b)
            .await
            .unwrap()
            .conversation;

        let bus = Arc::new(TopicBus::default());
        let push = PushService::start(pool.clone(), RecordingFcmClient::new(), 1, "chat.sotto.app".into());
        let service = CallService::with_ring_timeout(
            pool,
            Arc::clone(&bus),
            push,
            Duration::from_millis(ring_ms),
        );
        (service, bus, conv.id, a, b)
    }

    #[tokio::test]
    async fn initiate_rings_the_peer_with_ice() {
        let (service, bus, conv, a, b) = setup(60_000).await;
        let peer = bus.register_session("peer").await;
        bus.subscribe(&topics::user(b), "peer").await;

        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        assert_eq!(initiated.status, "ringing");
        assert!(!initiated.ice_servers.is_empty());

        let event = peer.recv().await.unwrap();
        assert_eq!(event.kind, "call.incoming");
        let parsed: serde_json::Value = serde_json::from_str(&event.frame).unwrap();
        assert_eq!(parsed["from_user_id"], a);
        assert!(parsed["ice_servers"].as_array().is_some());
    }

    #[tokio::test]
    async fn full_flow_accept_then_end() {
        let (service, bus, conv, a, b) = setup(60_000).await;
        let initiator = bus.register_session("init").await;
        bus.subscribe(&topics::user(a), "init").await;

        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        let accepted = service.accept(initiated.call_id, b).await.unwrap();
        assert_eq!(accepted.status, "ongoing");

        let event = initiator.recv().await.unwrap();
        assert_eq!(event.kind, "call.accepted");

        let ended = service.end(initiated.call_id, a).await.unwrap();
        assert!(ended.duration_secs >= 0);
        let call = service.call(initiated.call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn reject_as_busy() {
        let (service, _, conv, a, b) = setup(60_000).await;
        let initiated = service.initiate(conv, a, "video").await.unwrap();
        let rejected = service.reject(initiated.call_id, b, true).await.unwrap();
        assert_eq!(rejected.status, "busy");
    }

    #[tokio::test]
    async fn non_participant_cannot_signal() {
        let (service, _, conv, a, _) = setup(60_000).await;
        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        assert!(service.accept(initiated.call_id, 999).await.is_err());
        assert!(service.end(initiated.call_id, 999).await.is_err());
    }

    #[tokio::test]
    async fn unanswered_call_goes_missed() {
        let (service, _, conv, a, _) = setup(30).await;
        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let call = service.call(initiated.call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Missed);
    }

    #[tokio::test]
    async fn accepted_call_is_not_missed_by_the_timer() {
        let (service, _, conv, a, b) = setup(50).await;
        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        service.accept(initiated.call_id, b).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        let call = service.call(initiated.call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Ongoing);
    }

    #[tokio::test]
    async fn sdp_and_ice_relay_opaquely() {
        let (service, bus, conv, a, b) = setup(60_000).await;
        let peer = bus.register_session("peer").await;
        bus.subscribe(&topics::user(b), "peer").await;

        let initiated = service.initiate(conv, a, "audio").await.unwrap();
        // Drain the call.incoming event.
        peer.recv().await.unwrap();

        let relay = SdpRelay {
            call_id: initiated.call_id,
            target_user_id: b,
            sdp: serde_json::json!({"type": "offer", "sdp": "v=0 opaque"}),
        };
        service.relay_sdp(a, &relay, false).await.unwrap();
        let event = peer.recv().await.unwrap();
        assert_eq!(event.kind, "call.offer");
        let parsed: serde_json::Value = serde_json::from_str(&event.frame).unwrap();
        assert_eq!(parsed["sdp"]["sdp"], "v=0 opaque");
        assert_eq!(parsed["from_user_id"], a);

        service
            .relay_ice(a, initiated.call_id, b, serde_json::json!({"candidate": "c"}))
            .await
            .unwrap();
        assert_eq!(peer.recv().await.unwrap().kind, "call.ice_candidate");
    }

    #[tokio::test]
    async fn toggles_broadcast_participant_state() {
        let (service, bus, conv, a, b) = setup(60_000).await;
        let watcher = bus.register_session("w").await;

        let initiated = service.initiate(conv, a, "video").await.unwrap();
        service.accept(initiated.call_id, b).await.unwrap();
        bus.subscribe(&topics::call(initiated.call_id), "w").await;

        let update = service.toggle(initiated.call_id, a, "mute", true).await.unwrap();
        assert!(update.is_muted);
        let event = watcher.recv().await.unwrap();
        assert_eq!(event.kind, "call.participant_update");
    }
}
