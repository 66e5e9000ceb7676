//! Router assembly and the long-running serve loop.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        extract::DefaultBodyLimit,
        routing::{get, post},
    },
    tower_http::{cors::CorsLayer, trace::TraceLayer},
    tracing::{info, warn},
};

use {
    sotto_bus::{RedisBroker, TopicBus},
    sotto_calls::CallService,
    sotto_chat::ChatService,
    sotto_config::Config,
    sotto_protocol::MAX_FILE_BYTES,
    sotto_push::{PushService, fcm::{FcmClient, HttpFcmClient, RecordingFcmClient}},
};

use crate::{auth, routes, scheduler, state::AppState, throttle, ws};

const PUSH_WORKERS: usize = 4;

/// Wire the full application state from configuration.
pub async fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let pool = sotto_storage::connect(&config.db_path).await?;
    let bus = Arc::new(TopicBus::default());

    if let Some(broker_url) = &config.broker_url {
        let broker = RedisBroker::start(broker_url, config.broker_key, Arc::clone(&bus)).await?;
        bus.set_broker(broker).await;
        info!("cross-node broker attached");
    }

    let fcm: Arc<dyn FcmClient> = match &config.fcm_credentials_path {
        Some(path) => Arc::new(HttpFcmClient::from_credentials_file(path)?),
        None => {
            warn!("no FCM credentials configured; push delivery is dry-run");
            RecordingFcmClient::new()
        }
    };
    if config.external_object_storage {
        // The S3-compatible backend is a deployment concern; this build
        // serves blobs from the local media directory either way.
        warn!("SOTTO_EXTERNAL_STORAGE is set but this build stores media locally");
    }

    let push = PushService::start(pool.clone(), fcm, PUSH_WORKERS, config.ios_bundle_id.clone());
    let chat = ChatService::new(pool.clone(), Arc::clone(&bus), Arc::clone(&push));
    let calls = CallService::new(pool.clone(), Arc::clone(&bus), Arc::clone(&push));

    Ok(AppState::new(config, pool, bus, chat, calls, push))
}

/// Build the router for a given state. Split from `serve` so tests can bind
/// an ephemeral listener.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    let media_routes = Router::new()
        .route("/chat/media/upload/", post(routes::media::upload))
        .layer(DefaultBodyLimit::max(MAX_FILE_BYTES + 1024 * 1024));

    Router::new()
        // Auth.
        .route("/auth/register", post(auth::register))
        .route("/auth/verify-email", post(auth::verify_email))
        .route("/auth/login", post(auth::login))
        .route("/auth/token/refresh", post(auth::refresh_token))
        .route("/auth/logout", post(auth::logout))
        // Conversations and messages.
        .route("/chat/conversations/", get(routes::chat::list_conversations))
        .route(
            "/chat/conversations/create/",
            post(routes::chat::create_private_conversation),
        )
        .route(
            "/chat/conversations/{id}/messages/",
            get(routes::chat::list_messages).post(routes::chat::send_message),
        )
        .route("/chat/conversations/{id}/read/", post(routes::chat::mark_read))
        // Media.
        .merge(media_routes)
        .route("/chat/media/{id}/download/", get(routes::media::download))
        .route("/chat/media/{id}/key/", get(routes::media::key))
        // Key service.
        .route("/encryption/keys/upload/", post(routes::keys::upload_bundle))
        .route("/encryption/keys/replenish/", post(routes::keys::replenish_prekeys))
        .route("/encryption/keys/rotate/", post(routes::keys::rotate_signed_prekey))
        .route("/encryption/keys/{user_id}/", get(routes::keys::fetch_bundle))
        .route(
            "/encryption/safety-number/{user_id}/",
            get(routes::keys::safety_number),
        )
        .route(
            "/encryption/sessions/{peer_id}/",
            get(routes::keys::get_ratchet_session)
                .put(routes::keys::put_ratchet_session)
                .delete(routes::keys::delete_ratchet_session),
        )
        .route("/encryption/alerts/", get(routes::keys::list_alerts))
        .route("/encryption/alerts/resolve/", post(routes::keys::resolve_alert))
        // Notifications.
        .route(
            "/notifications/devices/register/",
            post(routes::notifications::register_device),
        )
        .route(
            "/notifications/preferences/",
            get(routes::notifications::get_preferences)
                .patch(routes::notifications::patch_preferences),
        )
        .route("/notifications/", get(routes::notifications::history))
        .route(
            "/notifications/{id}/read/",
            post(routes::notifications::mark_notification_read),
        )
        .route("/notifications/mute/", post(routes::notifications::mute))
        .route("/notifications/unmute/", post(routes::notifications::unmute))
        // Realtime.
        .route("/ws/chat", get(ws::chat_ws))
        .route("/ws/calls", get(ws::calls_ws))
        // Liveness.
        .route("/healthz", get(|| async { "ok" }))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            throttle::throttle_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Run the gateway until the process is stopped.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind = config.bind;
    let state = build_state(config).await?;
    scheduler::start(Arc::clone(&state));

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
