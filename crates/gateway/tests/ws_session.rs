//! WebSocket session router tests: auth close codes, live delivery,
//! presence, and error frames that keep the socket open.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    sotto_config::Config,
    sotto_gateway::server::{build_state, router},
    tokio_tungstenite::tungstenite::Message,
};

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    _media_dir: tempfile::TempDir,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

impl TestServer {
    async fn start() -> Self {
        let media_dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests();
        config.media_dir = media_dir.path().to_string_lossy().into_owned();

        let state = build_state(config).await.unwrap();
        let app = router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            client: reqwest::Client::new(),
            _media_dir: media_dir,
        }
    }

    async fn signup(&self, email: &str, username: &str) -> (i64, String) {
        let body: serde_json::Value = self
            .client
            .post(format!("http://{}/auth/register", self.addr))
            .json(&serde_json::json!({
                "email": email,
                "username": username,
                "password": "correct horse",
                "password_confirm": "correct horse",
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let user_id = body["id"].as_i64().unwrap();

        let body: serde_json::Value = self
            .client
            .post(format!("http://{}/auth/login", self.addr))
            .json(&serde_json::json!({ "email": email, "password": "correct horse" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        (user_id, body["access"].as_str().unwrap().to_string())
    }

    async fn open_conversation(&self, token: &str, peer_id: i64) -> String {
        let body: serde_json::Value = self
            .client
            .post(format!("http://{}/chat/conversations/create/", self.addr))
            .bearer_auth(token)
            .json(&serde_json::json!({ "user_id": peer_id }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["conversation_id"].as_str().unwrap().to_string()
    }

    async fn connect_ws(&self, token: &str) -> WsStream {
        let url = format!("ws://{}/ws/chat?token={token}", self.addr);
        let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        stream
    }
}

/// Read frames until one of the given `type` arrives, skipping others.
async fn next_event_of(ws: &mut WsStream, kind: &str) -> serde_json::Value {
    for _ in 0..50 {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind || (kind == "error" && value.get("error").is_some()) {
                return value;
            }
        }
    }
    panic!("event {kind} never arrived");
}

#[tokio::test]
async fn bad_token_closes_with_4001() {
    let server = TestServer::start().await;
    let url = format!("ws://{}/ws/chat?token=bogus", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    match ws.next().await.unwrap().unwrap() {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4001),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn live_message_delivery_between_sockets() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;
    let conversation_id = server.open_conversation(&alice_token, bob_id).await;

    let mut bob_ws = server.connect_ws(&bob_token).await;
    let mut alice_ws = server.connect_ws(&alice_token).await;

    alice_ws
        .send(Message::Text(
            serde_json::json!({
                "action": "send_message",
                "conversation_id": conversation_id,
                "message_type": "text",
                "content_encrypted": "aGVsbG8=",
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let event = next_event_of(&mut bob_ws, "chat.message").await;
    assert_eq!(event["content_encrypted"], "aGVsbG8=");
    assert_eq!(event["conversation_id"].as_str().unwrap(), conversation_id);
}

#[tokio::test]
async fn presence_is_published_on_connect_and_disconnect() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;
    server.open_conversation(&alice_token, bob_id).await;

    let mut alice_ws = server.connect_ws(&alice_token).await;
    let bob_ws = server.connect_ws(&bob_token).await;

    let online = next_event_of(&mut alice_ws, "presence.update").await;
    assert_eq!(online["user_id"], bob_id);
    assert_eq!(online["online"], true);

    drop(bob_ws);
    let offline = next_event_of(&mut alice_ws, "presence.update").await;
    assert_eq!(offline["user_id"], bob_id);
    assert_eq!(offline["online"], false);
}

#[tokio::test]
async fn unknown_action_answers_error_without_closing() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, _) = server.signup("bob@example.com", "bob").await;
    let conversation_id = server.open_conversation(&alice_token, bob_id).await;

    let mut ws = server.connect_ws(&alice_token).await;

    ws.send(Message::Text(
        serde_json::json!({ "action": "fly_to_moon" }).to_string().into(),
    ))
    .await
    .unwrap();
    let error = next_event_of(&mut ws, "error").await;
    assert_eq!(error["action"], "fly_to_moon");

    // The socket still works after the error.
    ws.send(Message::Text(
        serde_json::json!({
            "action": "typing",
            "conversation_id": conversation_id,
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let event = next_event_of(&mut ws, "typing.indicator").await;
    assert_eq!(event["is_typing"], true);
}

#[tokio::test]
async fn handler_error_keeps_the_connection_open() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;

    let mut ws = server.connect_ws(&alice_token).await;

    // Sending into a nonexistent conversation fails but does not close.
    ws.send(Message::Text(
        serde_json::json!({
            "action": "send_message",
            "conversation_id": uuid::Uuid::new_v4(),
            "message_type": "text",
            "content_encrypted": "eA==",
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let error = next_event_of(&mut ws, "error").await;
    assert_eq!(error["action"], "send_message");
}

#[tokio::test]
async fn call_flow_over_sockets() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;
    let conversation_id = server.open_conversation(&alice_token, bob_id).await;

    let mut alice_ws = server.connect_ws(&alice_token).await;
    let mut bob_ws = server.connect_ws(&bob_token).await;

    alice_ws
        .send(Message::Text(
            serde_json::json!({
                "action": "initiate_call",
                "conversation_id": conversation_id,
                "call_type": "audio",
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    let initiated = next_event_of(&mut alice_ws, "call.initiated").await;
    assert_eq!(initiated["status"], "ringing");
    assert!(initiated["ice_servers"].as_array().is_some());
    let call_id = initiated["call_id"].as_str().unwrap().to_string();

    let incoming = next_event_of(&mut bob_ws, "call.incoming").await;
    assert_eq!(incoming["call_id"].as_str().unwrap(), call_id);

    bob_ws
        .send(Message::Text(
            serde_json::json!({ "action": "accept_call", "call_id": call_id })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let accepted = next_event_of(&mut alice_ws, "call.accepted").await;
    assert_eq!(accepted["status"], "ongoing");

    alice_ws
        .send(Message::Text(
            serde_json::json!({ "action": "end_call", "call_id": call_id })
                .to_string()
                .into(),
        ))
        .await
        .unwrap();
    let ended = next_event_of(&mut bob_ws, "call.ended").await;
    assert_eq!(ended["call_id"].as_str().unwrap(), call_id);
}

#[tokio::test]
async fn disconnect_synthesizes_end_call() {
    let server = TestServer::start().await;
    let (_alice, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;
    let conversation_id = server.open_conversation(&alice_token, bob_id).await;

    let mut alice_ws = server.connect_ws(&alice_token).await;
    let mut bob_ws = server.connect_ws(&bob_token).await;

    alice_ws
        .send(Message::Text(
            serde_json::json!({
                "action": "initiate_call",
                "conversation_id": conversation_id,
                "call_type": "audio",
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    next_event_of(&mut alice_ws, "call.initiated").await;
    next_event_of(&mut bob_ws, "call.incoming").await;

    // Initiator vanishes; the server ends the call for them.
    drop(alice_ws);
    let ended = next_event_of(&mut bob_ws, "call.ended").await;
    assert_eq!(ended["type"], "call.ended");
}
