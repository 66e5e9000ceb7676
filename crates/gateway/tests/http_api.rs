//! HTTP surface tests against a live gateway on an ephemeral port.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc};

use {
    base64::Engine,
    crypto_common::generate::Generate,
    sotto_config::Config,
    sotto_crypto::bundle::IdentityKeys,
    sotto_gateway::server::{build_state, router},
};

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    _media_dir: tempfile::TempDir,
}

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

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Register + login, returning (user_id, access token).
    async fn signup(&self, email: &str, username: &str) -> (i64, String) {
        let response = self
            .client
            .post(self.url("/auth/register"))
            .json(&serde_json::json!({
                "email": email,
                "username": username,
                "password": "correct horse",
                "password_confirm": "correct horse",
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        let user_id = body["id"].as_i64().unwrap();

        let response = self
            .client
            .post(self.url("/auth/login"))
            .json(&serde_json::json!({ "email": email, "password": "correct horse" }))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        (user_id, body["access"].as_str().unwrap().to_string())
    }
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn bundle_body(keys: &IdentityKeys, prekey_count: u32) -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    let spk = keys.signed_prekey(now);
    let prekeys: Vec<serde_json::Value> = sotto_crypto::bundle::generate_one_time_prekeys(prekey_count, 0)
        .iter()
        .map(|(id, _, public)| serde_json::json!({ "key_id": id, "public_key": b64(public) }))
        .collect();
    serde_json::json!({
        "crypto_version": 2,
        "identity_key_public": b64(&keys.signing_public()),
        "identity_dh_key_public": b64(&keys.dh_public()),
        "signed_prekey_public": b64(&spk.public),
        "signed_prekey_signature": b64(&spk.signature),
        "signed_prekey_id": 1,
        "signed_prekey_timestamp": now,
        "one_time_prekeys": prekeys,
    })
}

#[tokio::test]
async fn register_login_and_private_message_round_trip() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;

    // Alice opens a private conversation with Bob.
    let response = server
        .client
        .post(server.url("/chat/conversations/create/"))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({ "user_id": bob_id }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["created"], true);
    assert_eq!(body["session_reset"], false);
    let conversation_id = body["conversation_id"].as_str().unwrap().to_string();

    // Re-opening returns the same conversation.
    let response = server
        .client
        .post(server.url("/chat/conversations/create/"))
        .bearer_auth(&bob_token)
        .json(&serde_json::json!({ "user_id": alice_id }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["created"], false);
    assert_eq!(body["conversation_id"].as_str().unwrap(), conversation_id);

    // REST send mirrors the pipeline.
    let response = server
        .client
        .post(server.url(&format!("/chat/conversations/{conversation_id}/messages/")))
        .bearer_auth(&alice_token)
        .json(&serde_json::json!({
            "message_type": "text",
            "content_encrypted": "aGVsbG8=",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Bob lists messages: first result carries the ciphertext, sender is Alice.
    let response = server
        .client
        .get(server.url(&format!("/chat/conversations/{conversation_id}/messages/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["results"][0]["content_encrypted"], "aGVsbG8=");
    assert_eq!(body["results"][0]["sender_id"], alice_id);

    // Bob's unread count is 1 until he marks the conversation read.
    let response = server
        .client
        .get(server.url("/chat/conversations/"))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["results"][0]["unread_count"], 1);

    let response = server
        .client
        .post(server.url(&format!("/chat/conversations/{conversation_id}/read/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
async fn login_does_not_disclose_account_existence() {
    let server = TestServer::start().await;
    server.signup("alice@example.com", "alice").await;

    let wrong_password = server
        .client
        .post(server.url("/auth/login"))
        .json(&serde_json::json!({ "email": "alice@example.com", "password": "wrong password" }))
        .send()
        .await
        .unwrap();
    let unknown_email = server
        .client
        .post(server.url("/auth/login"))
        .json(&serde_json::json!({ "email": "nobody@example.com", "password": "wrong password" }))
        .send()
        .await
        .unwrap();

    assert_eq!(wrong_password.status(), unknown_email.status());
    let a: serde_json::Value = wrong_password.json().await.unwrap();
    let b: serde_json::Value = unknown_email.json().await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn refresh_rotates_and_logout_revokes() {
    let server = TestServer::start().await;
    server.signup("alice@example.com", "alice").await;

    let response = server
        .client
        .post(server.url("/auth/login"))
        .json(&serde_json::json!({ "email": "alice@example.com", "password": "correct horse" }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let refresh = body["refresh"].as_str().unwrap().to_string();

    let response = server
        .client
        .post(server.url("/auth/token/refresh"))
        .json(&serde_json::json!({ "refresh": refresh }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    let rotated = body["refresh"].as_str().unwrap().to_string();
    assert_ne!(rotated, refresh);

    // The old refresh token is now on the blacklist.
    let response = server
        .client
        .post(server.url("/auth/token/refresh"))
        .json(&serde_json::json!({ "refresh": refresh }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    // Logout revokes the rotated one too.
    server
        .client
        .post(server.url("/auth/logout"))
        .json(&serde_json::json!({ "refresh": rotated }))
        .send()
        .await
        .unwrap();
    let response = server
        .client
        .post(server.url("/auth/token/refresh"))
        .json(&serde_json::json!({ "refresh": rotated }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn key_bundle_upload_fetch_and_consumption() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "alice").await;
    let (_bob_id, bob_token) = server.signup("bob@example.com", "bob").await;

    let alice_keys = IdentityKeys::generate();
    let response = server
        .client
        .post(server.url("/encryption/keys/upload/"))
        .bearer_auth(&alice_token)
        .json(&bundle_body(&alice_keys, 2))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["one_time_prekeys_accepted"], 2);

    // Self-fetch is forbidden.
    let response = server
        .client
        .get(server.url(&format!("/encryption/keys/{alice_id}/")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    // Bob fetches Alice's bundle, consuming a prekey.
    let response = server
        .client
        .get(server.url(&format!("/encryption/keys/{alice_id}/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["one_time_prekey_id"], 0);
    assert_eq!(body["prekeys_remaining"], 1);

    // Second fetch gets the next prekey; third gets none.
    let response = server
        .client
        .get(server.url(&format!("/encryption/keys/{alice_id}/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["one_time_prekey_id"], 1);
    assert_eq!(body["prekeys_remaining"], 0);

    let response = server
        .client
        .get(server.url(&format!("/encryption/keys/{alice_id}/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["one_time_prekey_id"].is_null());
}

#[tokio::test]
async fn forged_bundle_upload_is_rejected_whole() {
    let server = TestServer::start().await;
    let (_, token) = server.signup("alice@example.com", "alice").await;

    let keys = IdentityKeys::generate();
    let impostor = IdentityKeys::generate();
    let mut body = bundle_body(&keys, 1);
    // Swap in a signature from the wrong identity.
    let spk = impostor.signed_prekey(chrono::Utc::now().timestamp());
    body["signed_prekey_signature"] = serde_json::json!(b64(&spk.signature));

    let response = server
        .client
        .post(server.url("/encryption/keys/upload/"))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn v1_bundle_upload_verifies_the_ed448_signature() {
    use sotto_crypto::bundle::{Ed448IdentityKey, sign_prekey_v1};

    let server = TestServer::start().await;
    let (_, token) = server.signup("alice@example.com", "alice").await;

    let identity = Ed448IdentityKey::generate(&mut rand::rngs::OsRng);
    let prekey_public = vec![7u8; 56];
    let now = chrono::Utc::now().timestamp();
    let blob = sign_prekey_v1(&identity, &prekey_public, now);

    let body = serde_json::json!({
        "crypto_version": 1,
        "identity_key_public": b64(identity.verifying_key().to_bytes().as_ref()),
        "identity_dh_key_public": b64(&[2u8; 56]),
        "signed_prekey_public": b64(&prekey_public),
        "signed_prekey_signature": b64(&blob),
        "signed_prekey_id": 1,
        "one_time_prekeys": [],
    });
    let response = server
        .client
        .post(server.url("/encryption/keys/upload/"))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // A blob signed by a different identity is rejected whole.
    let impostor = Ed448IdentityKey::generate(&mut rand::rngs::OsRng);
    let mut forged = body;
    forged["signed_prekey_signature"] =
        serde_json::json!(b64(&sign_prekey_v1(&impostor, &prekey_public, now)));
    let response = server
        .client
        .post(server.url("/encryption/keys/upload/"))
        .bearer_auth(&token)
        .json(&forged)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn identity_change_raises_a_high_severity_alert() {
    let server = TestServer::start().await;
    let (_, token) = server.signup("eve@example.com", "eve").await;

    let first = IdentityKeys::generate();
    let second = IdentityKeys::generate();
    for keys in [&first, &second] {
        let response = server
            .client
            .post(server.url("/encryption/keys/upload/"))
            .bearer_auth(&token)
            .json(&bundle_body(keys, 0))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    let response = server
        .client
        .get(server.url("/encryption/alerts/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    let alert = body["alerts"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["alert_type"] == "identity_change")
        .expect("identity_change alert");
    assert_eq!(alert["severity"], "high");
    assert!(alert["metadata"]["old_key_prefix"].is_string());
    assert!(alert["metadata"]["new_key_prefix"].is_string());
    assert!(alert["metadata"]["ip"].is_string());
}

#[tokio::test]
async fn replenish_enforces_batch_cap() {
    let server = TestServer::start().await;
    let (_, token) = server.signup("alice@example.com", "alice").await;
    let keys = IdentityKeys::generate();
    server
        .client
        .post(server.url("/encryption/keys/upload/"))
        .bearer_auth(&token)
        .json(&bundle_body(&keys, 0))
        .send()
        .await
        .unwrap();

    let too_many: Vec<serde_json::Value> = (0..201)
        .map(|i| serde_json::json!({ "key_id": i, "public_key": b64(&[7u8; 32]) }))
        .collect();
    let response = server
        .client
        .post(server.url("/encryption/keys/replenish/"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "one_time_prekeys": too_many }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let exactly_cap: Vec<serde_json::Value> = (0..200)
        .map(|i| serde_json::json!({ "key_id": i, "public_key": b64(&[7u8; 32]) }))
        .collect();
    let response = server
        .client
        .post(server.url("/encryption/keys/replenish/"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "one_time_prekeys": exactly_cap }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["accepted"], 200);
}

#[tokio::test]
async fn safety_number_is_symmetric() {
    let server = TestServer::start().await;
    let (alice_id, alice_token) = server.signup("alice@example.com", "alice").await;
    let (bob_id, bob_token) = server.signup("bob@example.com", "bob").await;

    for token in [&alice_token, &bob_token] {
        let keys = IdentityKeys::generate();
        server
            .client
            .post(server.url("/encryption/keys/upload/"))
            .bearer_auth(token)
            .json(&bundle_body(&keys, 0))
            .send()
            .await
            .unwrap();
    }

    let alice_view: serde_json::Value = server
        .client
        .get(server.url(&format!("/encryption/safety-number/{bob_id}/")))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bob_view: serde_json::Value = server
        .client
        .get(server.url(&format!("/encryption/safety-number/{alice_id}/")))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(alice_view["safety_number"], bob_view["safety_number"]);
    assert_eq!(
        alice_view["safety_number_raw"].as_str().unwrap().len(),
        60
    );
}

#[tokio::test]
async fn ratchet_sessions_store_opaque_blobs() {
    let server = TestServer::start().await;
    let (_, token) = server.signup("alice@example.com", "alice").await;

    let blob = b64(b"not-actually-json\x00\x01\x02");
    let response = server
        .client
        .put(server.url("/encryption/sessions/42/"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "state": blob }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body: serde_json::Value = server
        .client
        .get(server.url("/encryption/sessions/42/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"].as_str().unwrap(), blob);
}

#[tokio::test]
async fn unauthenticated_requests_are_401() {
    let server = TestServer::start().await;
    let response = server
        .client
        .get(server.url("/chat/conversations/"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn device_registration_and_preferences() {
    let server = TestServer::start().await;
    let (_, token) = server.signup("alice@example.com", "alice").await;

    let response = server
        .client
        .post(server.url("/notifications/devices/register/"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "device_id": "phone-1",
            "token": "fcm-token",
            "platform": "android",
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    // Preferences auto-create with everything enabled.
    let body: serde_json::Value = server
        .client
        .get(server.url("/notifications/preferences/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["new_message"], true);
    assert_eq!(body["dnd_enabled"], false);

    let body: serde_json::Value = server
        .client
        .patch(server.url("/notifications/preferences/"))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "dnd_enabled": true,
            "dnd_start": "22:00",
            "dnd_end": "07:00",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["dnd_enabled"], true);
    assert_eq!(body["dnd_start"], "22:00");
}
