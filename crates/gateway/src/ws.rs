//! The session router: WebSocket lifecycle, topic membership, and inbound
//! frame demultiplexing.
//!
//! Each connection runs two tasks: this read loop, and a write loop that
//! drains both the bus subscription queue and direct replies onto the
//! socket. A handler error answers `{error, action}` on the same socket and
//! never closes the connection; only auth failures close (4001).

use std::{collections::HashSet, sync::Arc};

use {
    axum::{
        extract::{
            ConnectInfo, Query, State, WebSocketUpgrade,
            ws::{CloseFrame, Message, WebSocket},
        },
        response::Response,
    },
    futures::{SinkExt, stream::StreamExt},
    serde::Deserialize,
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
    uuid::Uuid,
};

use {
    sotto_common::time::to_rfc3339,
    sotto_protocol::{
        ClientAction, ErrorFrame, MAX_PAYLOAD_BYTES, PresenceWire, ServerEvent, close_codes,
        topics,
    },
    sotto_storage::types::DeliveryStatus,
};

use crate::state::AppState;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Chat,
    Calls,
}

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
}

pub async fn chat_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state, query.token, Endpoint::Chat, addr)
    })
}

pub async fn calls_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state, query.token, Endpoint::Calls, addr)
    })
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    token: String,
    endpoint: Endpoint,
    addr: std::net::SocketAddr,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // ── Authenticate ────────────────────────────────────────────────────
    let user_id = match state
        .tokens
        .verify(&token, sotto_storage::tokens::TokenKind::Access)
        .await
    {
        Ok(user_id) => user_id,
        Err(_) => {
            warn!(remote = %addr, "ws: auth failed");
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_codes::UNAUTHORIZED,
                    reason: "authentication failed".into(),
                })))
                .await;
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, user_id, remote = %addr, "ws: connected");

    // ── Attach to the bus ───────────────────────────────────────────────
    let handle = state.bus.register_session(conn_id.clone()).await;
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    state.bus.subscribe(&topics::user(user_id), &conn_id).await;
    let conversation_ids = match state.conversations.conversation_ids_for_user(user_id).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "ws: conversation resolution failed");
            vec![]
        }
    };
    for conversation_id in &conversation_ids {
        state
            .bus
            .subscribe(&topics::conversation(*conversation_id), &conn_id)
            .await;
    }

    // ── Presence: online ────────────────────────────────────────────────
    if let Err(e) = state.users.set_online(user_id, true).await {
        warn!(error = %e, "ws: presence write failed");
    }
    publish_presence(&state, user_id, true, &conversation_ids).await;

    // ── Write loop ──────────────────────────────────────────────────────
    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                direct = client_rx.recv() => {
                    let Some(frame) = direct else { break };
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                event = handle.recv() => {
                    let Some(event) = event else { break };
                    if ws_tx.send(Message::Text(event.frame.clone().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(conn_id = %write_conn_id, "ws: write loop closed");
    });

    // ── Read loop ───────────────────────────────────────────────────────
    // Calls this connection is actively part of; disconnect synthesizes an
    // end_call for each.
    let mut active_calls: HashSet<Uuid> = HashSet::new();

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            }
        };

        if text.len() > MAX_PAYLOAD_BYTES {
            send_error(&client_tx, "payload too large", None);
            continue;
        }

        let action: ClientAction = match serde_json::from_str(&text) {
            Ok(action) => action,
            Err(e) => {
                // Echo back the claimed action name when there is one.
                let claimed = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(String::from));
                debug!(conn_id = %conn_id, error = %e, "ws: bad frame");
                send_error(&client_tx, "unknown or malformed action", claimed.as_deref());
                continue;
            }
        };

        let action_name = action.name();
        if let Err(error) = dispatch(
            &state,
            endpoint,
            user_id,
            &conn_id,
            &client_tx,
            &mut active_calls,
            action,
        )
        .await
        {
            // Handler failures answer on the socket and keep it open.
            send_error(&client_tx, &error, Some(action_name));
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────────
    for call_id in active_calls {
        if let Err(e) = state.calls.end(call_id, user_id).await {
            debug!(call_id = %call_id, error = %e, "ws: synthesized end_call failed");
        }
    }

    state.bus.remove_session(&conn_id).await;
    if let Err(e) = state.users.set_online(user_id, false).await {
        warn!(error = %e, "ws: presence write failed");
    }
    let conversation_ids = state
        .conversations
        .conversation_ids_for_user(user_id)
        .await
        .unwrap_or_default();
    publish_presence(&state, user_id, false, &conversation_ids).await;

    write_handle.abort();
    info!(conn_id = %conn_id, user_id, "ws: disconnected");
}

fn send_error(client_tx: &mpsc::UnboundedSender<String>, error: &str, action: Option<&str>) {
    if let Ok(frame) = serde_json::to_string(&ErrorFrame::new(error, action)) {
        let _ = client_tx.send(frame);
    }
}

async fn publish_presence(state: &Arc<AppState>, user_id: i64, online: bool, conversations: &[Uuid]) {
    let event = ServerEvent::PresenceUpdate(PresenceWire {
        user_id,
        online,
        last_seen: to_rfc3339(chrono::Utc::now()),
    });
    for conversation_id in conversations {
        state
            .bus
            .publish(&topics::conversation(*conversation_id), &event)
            .await
            .ok();
    }
}

/// Route one inbound frame. String errors become `{error, action}` frames.
async fn dispatch(
    state: &Arc<AppState>,
    endpoint: Endpoint,
    user_id: i64,
    conn_id: &str,
    client_tx: &mpsc::UnboundedSender<String>,
    active_calls: &mut HashSet<Uuid>,
    action: ClientAction,
) -> Result<(), String> {
    // The calls endpoint only signals; the chat endpoint routes everything.
    if endpoint == Endpoint::Calls
        && matches!(
            action,
            ClientAction::SendMessage(_)
                | ClientAction::Typing(_)
                | ClientAction::StopTyping(_)
                | ClientAction::ReadReceipt(_)
                | ClientAction::Delivered(_)
                | ClientAction::EditMessage(_)
                | ClientAction::DeleteMessage(_)
                | ClientAction::React(_)
        )
    {
        return Err("action not available on this endpoint".into());
    }

    match action {
        // ── Message pipeline ────────────────────────────────────────────
        ClientAction::SendMessage(input) => {
            state
                .chat
                .send_message(user_id, input)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::Typing(input) => {
            state
                .chat
                .typing(user_id, input.conversation_id, true, input.is_recording)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::StopTyping(input) => {
            state
                .chat
                .typing(user_id, input.conversation_id, false, false)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::Delivered(receipt) => {
            state
                .chat
                .update_statuses(user_id, &receipt.message_ids, DeliveryStatus::Delivered)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::ReadReceipt(receipt) => {
            state
                .chat
                .update_statuses(user_id, &receipt.message_ids, DeliveryStatus::Read)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::EditMessage(input) => {
            state
                .chat
                .edit_message(user_id, input)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::DeleteMessage(input) => {
            state
                .chat
                .delete_message(user_id, input.message_id)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::React(input) => {
            state.chat.react(user_id, input).await.map_err(|e| e.to_string())?;
        }

        // ── Call signaling ──────────────────────────────────────────────
        ClientAction::InitiateCall(input) => {
            let initiated = state
                .calls
                .initiate(input.conversation_id, user_id, &input.call_type)
                .await
                .map_err(|e| e.to_string())?;
            active_calls.insert(initiated.call_id);
            state
                .bus
                .subscribe(&topics::call(initiated.call_id), conn_id)
                .await;
            let frame = serde_json::to_string(&ServerEvent::CallInitiated(initiated))
                .map_err(|e| e.to_string())?;
            let _ = client_tx.send(frame);
        }
        ClientAction::AcceptCall(call) => {
            state
                .calls
                .accept(call.call_id, user_id)
                .await
                .map_err(|e| e.to_string())?;
            active_calls.insert(call.call_id);
            state.bus.subscribe(&topics::call(call.call_id), conn_id).await;
        }
        ClientAction::RejectCall(input) => {
            state
                .calls
                .reject(input.call_id, user_id, input.busy)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::Offer(relay) => {
            state
                .calls
                .relay_sdp(user_id, &relay, false)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::Answer(relay) => {
            state
                .calls
                .relay_sdp(user_id, &relay, true)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::IceCandidate(relay) => {
            state
                .calls
                .relay_ice(user_id, relay.call_id, relay.target_user_id, relay.candidate)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::EndCall(call) => {
            state
                .calls
                .end(call.call_id, user_id)
                .await
                .map_err(|e| e.to_string())?;
            active_calls.remove(&call.call_id);
            state.bus.unsubscribe(&topics::call(call.call_id), conn_id).await;
        }
        ClientAction::ToggleMute(toggle) => {
            state
                .calls
                .toggle(toggle.call_id, user_id, "mute", toggle.enabled)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::ToggleVideo(toggle) => {
            state
                .calls
                .toggle(toggle.call_id, user_id, "video", toggle.enabled)
                .await
                .map_err(|e| e.to_string())?;
        }
        ClientAction::ToggleSpeaker(toggle) => {
            state
                .calls
                .toggle(toggle.call_id, user_id, "speaker", toggle.enabled)
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}
