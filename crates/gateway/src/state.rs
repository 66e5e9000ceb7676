//! Shared application state: one immutable snapshot of config plus the
//! repositories and services every handler needs.

use std::sync::Arc;

use {
    sotto_bus::TopicBus,
    sotto_calls::CallService,
    sotto_chat::ChatService,
    sotto_config::Config,
    sotto_push::PushService,
    sotto_storage::{
        StoreError,
        attachments::AttachmentRepo,
        calls::CallRepo,
        conversations::ConversationRepo,
        devices::DeviceTokenRepo,
        keys::KeyRepo,
        messages::MessageRepo,
        notifications::{MuteRepo, NotificationRepo, PreferenceRepo},
        security::SecurityAlertRepo,
        tokens::TokenRepo,
        users::UserRepo,
    },
};

use crate::throttle::RequestThrottle;

pub struct AppState {
    pub config: Config,
    pub pool: sqlx::SqlitePool,
    pub bus: Arc<TopicBus>,
    pub chat: Arc<ChatService>,
    pub calls: Arc<CallService>,
    pub push: Arc<PushService>,
    pub throttle: RequestThrottle,

    pub users: UserRepo,
    pub tokens: TokenRepo,
    pub conversations: ConversationRepo,
    pub messages: MessageRepo,
    pub attachments: AttachmentRepo,
    pub keys: KeyRepo,
    pub devices: DeviceTokenRepo,
    pub notifications: NotificationRepo,
    pub preferences: PreferenceRepo,
    pub mutes: MuteRepo,
    pub call_repo: CallRepo,
    pub alerts: SecurityAlertRepo,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: sqlx::SqlitePool,
        bus: Arc<TopicBus>,
        chat: Arc<ChatService>,
        calls: Arc<CallService>,
        push: Arc<PushService>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            chat,
            calls,
            push,
            throttle: RequestThrottle::new(),
            users: UserRepo::new(pool.clone()),
            tokens: TokenRepo::new(pool.clone()),
            conversations: ConversationRepo::new(pool.clone()),
            messages: MessageRepo::new(pool.clone()),
            attachments: AttachmentRepo::new(pool.clone()),
            keys: KeyRepo::new(pool.clone()),
            devices: DeviceTokenRepo::new(pool.clone()),
            notifications: NotificationRepo::new(pool.clone()),
            preferences: PreferenceRepo::new(pool.clone()),
            mutes: MuteRepo::new(pool.clone()),
            call_repo: CallRepo::new(pool.clone()),
            alerts: SecurityAlertRepo::new(pool.clone()),
            pool,
        })
    }

    /// Central per-user hourly limiter backed by the rate_events table, so
    /// it holds across nodes.
    pub async fn check_user_rate(
        &self,
        user_id: i64,
        scope: &'static str,
        limit_per_hour: i64,
    ) -> Result<(), StoreError> {
        let used = self.keys.rate_events_in_window(user_id, scope, 3600).await?;
        if used >= limit_per_hour {
            return Err(StoreError::RateLimited(scope));
        }
        self.keys.record_rate_event(user_id, scope).await?;
        Ok(())
    }
}
