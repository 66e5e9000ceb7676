//! Push dispatch: gate → throttle → persist → vendor fan-out.
//!
//! The gate sequence short-circuits to a drop; only requests that clear
//! every gate persist a Notification row and reach the vendor adapter.
//! High-priority traffic (incoming calls, security alerts) bypasses DND
//! and the duplicate throttle but not preferences or mutes.

use std::sync::Arc;

use {
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use sotto_storage::{
    devices::DeviceTokenRepo,
    notifications::{MuteRepo, NewNotification, NotificationRepo, PreferenceRepo},
    types::Notification,
};

pub mod dnd;
pub mod fcm;
pub mod throttle;

pub use fcm::{FcmClient, FcmError, FcmMessage, HttpFcmClient, SendOutcome};

use {dnd::in_dnd_window, throttle::ThrottleCache};

/// Everything a caller provides to request a push.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub recipient_id: i64,
    pub notification_type: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub sender_id: Option<i64>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    /// Mute-rule target; usually the conversation or channel.
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub high_priority: bool,
}

/// Why a request never became a Notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SelfRecipient,
    PreferenceDisabled,
    DndActive,
    Muted,
    Throttled,
}

#[derive(Debug)]
pub enum Dispatch {
    Sent(Notification),
    Dropped(DropReason),
}

pub struct PushService {
    notifications: NotificationRepo,
    preferences: PreferenceRepo,
    mutes: MuteRepo,
    devices: DeviceTokenRepo,
    throttle: ThrottleCache,
    delivery_tx: mpsc::UnboundedSender<Notification>,
}

impl PushService {
    /// Build the service and spawn `workers` delivery tasks draining the
    /// queue through `client`.
    pub fn start(
        pool: sqlx::SqlitePool,
        client: Arc<dyn FcmClient>,
        workers: usize,
        ios_bundle_id: String,
    ) -> Arc<Self> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel::<Notification>();
        let service = Arc::new(Self {
            notifications: NotificationRepo::new(pool.clone()),
            preferences: PreferenceRepo::new(pool.clone()),
            mutes: MuteRepo::new(pool.clone()),
            devices: DeviceTokenRepo::new(pool),
            throttle: ThrottleCache::new(),
            delivery_tx,
        });

        let delivery_rx = Arc::new(tokio::sync::Mutex::new(delivery_rx));
        for worker in 0..workers.max(1) {
            let service = Arc::clone(&service);
            let client = Arc::clone(&client);
            let delivery_rx = Arc::clone(&delivery_rx);
            let bundle_id = ios_bundle_id.clone();
            tokio::spawn(async move {
                loop {
                    let notification = {
                        let mut rx = delivery_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(notification) = notification else {
                        debug!(worker, "push worker: queue closed");
                        break;
                    };
                    service
                        .deliver(client.as_ref(), &bundle_id, &notification)
                        .await;
                }
            });
        }

        service
    }

    /// Gate, persist, and enqueue. Returns what happened so callers (and
    /// tests) can observe drops.
    pub async fn send(&self, request: PushRequest) -> sotto_storage::Result<Dispatch> {
        // 1. Never notify yourself.
        if request.sender_id == Some(request.recipient_id) {
            return Ok(Dispatch::Dropped(DropReason::SelfRecipient));
        }

        // 2. Per-type preference (auto-created all-true on first sight).
        let prefs = self.preferences.get_or_create(request.recipient_id).await?;
        if !prefs.allows(&request.notification_type) {
            debug!(recipient = request.recipient_id, r#type = %request.notification_type, "push: preference disabled");
            return Ok(Dispatch::Dropped(DropReason::PreferenceDisabled));
        }

        // 3. DND window, unless high priority.
        if !request.high_priority
            && prefs.dnd_enabled
            && in_dnd_window(
                prefs.dnd_start.as_deref(),
                prefs.dnd_end.as_deref(),
                chrono::Local::now().time(),
            )
        {
            return Ok(Dispatch::Dropped(DropReason::DndActive));
        }

        // 4. Mute rules on the source target.
        if let (Some(target_type), Some(target_id)) = (&request.target_type, &request.target_id) {
            if self
                .mutes
                .is_muted(request.recipient_id, target_type, target_id)
                .await?
            {
                return Ok(Dispatch::Dropped(DropReason::Muted));
            }
        }

        // 5. Duplicate suppression, unless high priority.
        let throttle_key = throttle::key(
            request.recipient_id,
            &request.notification_type,
            request.source_type.as_deref().unwrap_or(""),
            request.source_id.as_deref().unwrap_or(""),
        );
        if !request.high_priority && self.throttle.check_and_insert(&throttle_key) {
            metrics::counter!("push_throttled").increment(1);
            return Ok(Dispatch::Dropped(DropReason::Throttled));
        }

        // 6. Enrich data with presentation flags.
        let mut data = request.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("show_preview".into(), prefs.show_preview.into());
            map.insert("sound_enabled".into(), prefs.sound_enabled.into());
            map.insert("vibration_enabled".into(), prefs.vibration_enabled.into());
            if request.high_priority {
                map.insert("high_priority".into(), true.into());
            }
        }

        // 7. Persist.
        let notification = self
            .notifications
            .insert(NewNotification {
                recipient_id: request.recipient_id,
                sender_id: request.sender_id,
                notification_type: request.notification_type,
                title: request.title,
                body: request.body,
                data,
                source_type: request.source_type,
                source_id: request.source_id,
            })
            .await?;

        // 8. Enqueue vendor delivery.
        if self.delivery_tx.send(notification.clone()).is_err() {
            warn!("push: delivery queue closed, notification persisted without dispatch");
        }
        Ok(Dispatch::Sent(notification))
    }

    /// Fan out one notification to the recipient's active devices, with
    /// retries and invalid-token reaping.
    async fn deliver(&self, client: &dyn FcmClient, ios_bundle_id: &str, notification: &Notification) {
        let tokens = match self.devices.active_for_user(notification.recipient_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(error = %e, "push: token lookup failed");
                return;
            }
        };
        if tokens.is_empty() {
            debug!(recipient = notification.recipient_id, "push: no active devices");
            let _ = self
                .notifications
                .stamp_fcm_result(notification.id, false, None, Some("no_active_devices"))
                .await;
            return;
        }

        let badge = self
            .notifications
            .unread_count(notification.recipient_id)
            .await
            .unwrap_or(0);
        let high_priority = notification.data.get("high_priority").is_some()
            || notification.notification_type == "incoming_call";
        let message = FcmMessage::build(notification, badge, high_priority, ios_bundle_id);

        let mut last_error: Option<String> = None;
        let mut first_message_id: Option<String> = None;
        let mut any_sent = false;

        // FCM multicast caps at 500 tokens per call. Tokens with transient
        // failures are retried up to three times with 10/20/40 s back-off;
        // invalid tokens are reaped on first sight.
        for batch in tokens.chunks(500) {
            let mut pending: Vec<String> = batch.iter().map(|t| t.token.clone()).collect();
            let mut delay_secs = 10u64;

            for attempt in 0..4 {
                if pending.is_empty() {
                    break;
                }
                if attempt > 0 {
                    tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
                    delay_secs *= 2;
                }

                let outcomes = match client.send_multicast(&pending, &message).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        // Transport failure: every token in the batch retries.
                        warn!(attempt, error = %e, "push: vendor call failed");
                        last_error = Some(e.to_string());
                        continue;
                    }
                };

                let mut still_pending = Vec::new();
                for (token, outcome) in pending.iter().zip(outcomes) {
                    match outcome {
                        SendOutcome::Delivered { message_id } => {
                            any_sent = true;
                            if first_message_id.is_none() {
                                first_message_id = Some(message_id);
                            }
                        }
                        SendOutcome::InvalidToken { code } => {
                            info!(code = %code, "push: reaping invalid token");
                            let _ = self.devices.deactivate_token(token).await;
                        }
                        SendOutcome::Failed { code } => {
                            last_error = Some(code);
                            still_pending.push(token.clone());
                        }
                    }
                }
                pending = still_pending;
            }
        }

        if let Err(e) = self
            .notifications
            .stamp_fcm_result(
                notification.id,
                any_sent,
                first_message_id.as_deref(),
                last_error.as_deref(),
            )
            .await
        {
            warn!(error = %e, "push: failed to stamp vendor outcome");
        }
    }

    /// Direct handle for callers that need to observe the row store.
    #[must_use]
    pub fn notifications(&self) -> &NotificationRepo {
        &self.notifications
    }
}
