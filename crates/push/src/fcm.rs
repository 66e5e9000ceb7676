//! FCM vendor adapter.
//!
//! The transport is a trait so delivery logic and tests run against a
//! recording client; the HTTP implementation posts FCM v1 `messages:send`
//! requests with a bearer token minted externally (service-account tooling
//! owns the OAuth dance; the credentials file carries project id and
//! token path).

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::json,
    thiserror::Error,
    tracing::debug,
};

use sotto_storage::types::Notification;

/// Vendor error codes that invalidate the token permanently.
const INVALID_TOKEN_CODES: &[&str] = &["NOT_FOUND", "UNREGISTERED", "INVALID_ARGUMENT"];

#[derive(Debug, Error)]
pub enum FcmError {
    #[error("vendor transport error: {0}")]
    Transport(String),

    #[error("vendor credentials missing or malformed: {0}")]
    Credentials(String),
}

/// Per-token result of a multicast call.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Delivered { message_id: String },
    /// The token is dead; reap it.
    InvalidToken { code: String },
    /// Transient; eligible for retry.
    Failed { code: String },
}

/// Classify a vendor error code string.
#[must_use]
pub fn classify(code: &str) -> SendOutcome {
    if INVALID_TOKEN_CODES.iter().any(|c| code.contains(c)) {
        SendOutcome::InvalidToken { code: code.to_string() }
    } else {
        SendOutcome::Failed { code: code.to_string() }
    }
}

// ── Message shape ────────────────────────────────────────────────────────────

/// A built vendor payload, platform configs included.
#[derive(Debug, Clone, Serialize)]
pub struct FcmMessage {
    /// Omitted for data-only (VoIP) pushes.
    pub notification: Option<FcmNotification>,
    pub data: serde_json::Value,
    pub android: serde_json::Value,
    pub apns: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmNotification {
    pub title: String,
    pub body: String,
}

impl FcmMessage {
    /// Android and iOS differ in TTL, priority, channel and sound; iOS VoIP
    /// pushes are data-only on the `.voip` APNs topic.
    #[must_use]
    pub fn build(
        notification: &Notification,
        badge: i64,
        high_priority: bool,
        ios_bundle_id: &str,
    ) -> Self {
        let is_voip = notification.notification_type == "incoming_call";
        let sound_enabled = notification
            .data
            .get("sound_enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);

        let android = json!({
            "priority": if high_priority { "high" } else { "normal" },
            "ttl": if is_voip { "30s" } else { "86400s" },
            "notification": {
                "channel_id": android_channel(&notification.notification_type),
                "sound": if sound_enabled { "default" } else { "" },
            },
        });

        let mut apns_headers = json!({
            "apns-priority": if high_priority { "10" } else { "5" },
        });
        if is_voip {
            apns_headers["apns-push-type"] = "voip".into();
            apns_headers["apns-topic"] = format!("{ios_bundle_id}.voip").into();
        } else {
            apns_headers["apns-push-type"] = "alert".into();
        }
        let apns = json!({
            "headers": apns_headers,
            "payload": {
                "aps": {
                    "badge": badge,
                    "sound": if sound_enabled { "default" } else { "" },
                    "content-available": if is_voip { 1 } else { 0 },
                },
            },
        });

        let mut data = notification.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("notification_type".into(), notification.notification_type.clone().into());
            if let Some(source_id) = &notification.source_id {
                map.insert("source_id".into(), source_id.clone().into());
            }
        }

        Self {
            // VoIP pushes are data-only so the app can drive CallKit itself.
            notification: (!is_voip).then(|| FcmNotification {
                title: notification.title.clone(),
                body: notification.body.clone(),
            }),
            data,
            android,
            apns,
        }
    }
}

fn android_channel(notification_type: &str) -> &'static str {
    match notification_type {
        "incoming_call" | "missed_call" => "calls",
        "security_alert" => "security",
        "message_reaction" | "mention" => "social",
        _ => "messages",
    }
}

// ── Transport trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait FcmClient: Send + Sync {
    /// Send one message to up to 500 tokens; one outcome per token, in
    /// token order.
    async fn send_multicast(
        &self,
        tokens: &[String],
        message: &FcmMessage,
    ) -> Result<Vec<SendOutcome>, FcmError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Credentials {
    project_id: String,
    /// Path to a file refreshed by external tooling with a current OAuth
    /// bearer token.
    access_token_path: String,
}

pub struct HttpFcmClient {
    http: reqwest::Client,
    project_id: String,
    access_token_path: String,
}

impl HttpFcmClient {
    pub fn from_credentials_file(path: &str) -> Result<Self, FcmError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| FcmError::Credentials(format!("{path}: {e}")))?;
        let creds: Credentials =
            serde_json::from_str(&raw).map_err(|e| FcmError::Credentials(e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            project_id: creds.project_id,
            access_token_path: creds.access_token_path,
        })
    }

    fn bearer_token(&self) -> Result<String, FcmError> {
        std::fs::read_to_string(&self.access_token_path)
            .map(|t| t.trim().to_string())
            .map_err(|e| FcmError::Credentials(format!("token file: {e}")))
    }

    async fn send_one(&self, token: &str, message: &FcmMessage) -> Result<SendOutcome, FcmError> {
        let url = format!(
            "https://fcm.googleapis.com/v1/projects/{}/messages:send",
            self.project_id
        );
        let body = json!({
            "message": {
                "token": token,
                "notification": message.notification,
                "data": stringify_values(&message.data),
                "android": message.android,
                "apns": message.apns,
            }
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(self.bearer_token()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| FcmError::Transport(e.to_string()))?;

        if response.status().is_success() {
            let value: serde_json::Value = response
                .json()
                .await
                .map_err(|e| FcmError::Transport(e.to_string()))?;
            let message_id = value
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(SendOutcome::Delivered { message_id });
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let code = extract_error_code(&body).unwrap_or_else(|| status.to_string());
        debug!(code = %code, "fcm: send failed");
        Ok(classify(&code))
    }
}

/// FCM requires `data` values to be strings.
fn stringify_values(data: &serde_json::Value) -> serde_json::Value {
    match data.as_object() {
        Some(map) => json!(
            map.iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect::<std::collections::HashMap<String, String>>()
        ),
        None => json!({}),
    }
}

fn extract_error_code(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    // v1 shape: {"error": {"status": "NOT_FOUND", "details": [{"errorCode": "UNREGISTERED"}]}}
    if let Some(details) = value["error"]["details"].as_array() {
        for detail in details {
            if let Some(code) = detail["errorCode"].as_str() {
                return Some(code.to_string());
            }
        }
    }
    value["error"]["status"].as_str().map(str::to_string)
}

#[async_trait]
impl FcmClient for HttpFcmClient {
    async fn send_multicast(
        &self,
        tokens: &[String],
        message: &FcmMessage,
    ) -> Result<Vec<SendOutcome>, FcmError> {
        // v1 has no multicast endpoint; fan out per token inside the batch.
        let mut outcomes = Vec::with_capacity(tokens.len());
        for token in tokens {
            outcomes.push(self.send_one(token, message).await?);
        }
        Ok(outcomes)
    }
}

// ── Recording client (tests and dry-run deployments) ─────────────────────────

/// Records every multicast and replies from a scripted outcome map.
#[derive(Default)]
pub struct RecordingFcmClient {
    pub calls: std::sync::Mutex<Vec<(Vec<String>, FcmMessage)>>,
    /// token → scripted error code; anything absent is delivered.
    pub scripted_errors: std::sync::Mutex<std::collections::HashMap<String, String>>,
}

impl RecordingFcmClient {
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn script_error(&self, token: &str, code: &str) {
        if let Ok(mut scripted) = self.scripted_errors.lock() {
            scripted.insert(token.to_string(), code.to_string());
        }
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FcmClient for RecordingFcmClient {
    async fn send_multicast(
        &self,
        tokens: &[String],
        message: &FcmMessage,
    ) -> Result<Vec<SendOutcome>, FcmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((tokens.to_vec(), message.clone()));
        }
        let scripted = self
            .scripted_errors
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        Ok(tokens
            .iter()
            .map(|token| match scripted.get(token) {
                Some(code) => classify(code),
                None => SendOutcome::Delivered {
                    message_id: format!("projects/test/messages/{token}"),
                },
            })
            .collect())
    }
}
