//! Cross-node fan-out.
//!
//! Every node publishes its bus events onto a shared Redis channel and
//! replays events originated by other nodes into its local bus. Payloads
//! are sealed with XChaCha20-Poly1305 when a fleet key is configured;
//! production deployments must set one.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::{info, warn},
    uuid::Uuid,
};

use crate::{BusError, BusEvent, TopicBus};

const BROKER_CHANNEL: &str = "sotto:bus";
const SEAL_AAD: &[u8] = b"sotto-broker-v1";

#[async_trait]
pub trait Broker: Send + Sync {
    /// Forward a locally published event to the rest of the fleet.
    async fn forward(&self, topic: &str, event: &BusEvent) -> Result<(), BusError>;
}

/// What travels between nodes.
#[derive(Serialize, Deserialize)]
struct Envelope {
    node: String,
    topic: String,
    kind: String,
    critical: bool,
    frame: String,
}

fn seal(key: Option<&[u8; 32]>, plain: &[u8]) -> Result<Vec<u8>, BusError> {
    match key {
        Some(key) => sotto_crypto::aead::encrypt(key, plain, SEAL_AAD)
            .map_err(|e| BusError::Seal(e.to_string())),
        None => Ok(plain.to_vec()),
    }
}

fn unseal(key: Option<&[u8; 32]>, data: &[u8]) -> Result<Vec<u8>, BusError> {
    match key {
        Some(key) => sotto_crypto::aead::decrypt(key, data, SEAL_AAD)
            .map_err(|e| BusError::Seal(e.to_string())),
        None => Ok(data.to_vec()),
    }
}

// ── Redis broker ─────────────────────────────────────────────────────────────

pub struct RedisBroker {
    node_id: String,
    key: Option<[u8; 32]>,
    connection: Mutex<redis::aio::MultiplexedConnection>,
}

impl RedisBroker {
    /// Connect, and spawn the inbound loop replaying remote events into
    /// `bus`.
    pub async fn start(
        url: &str,
        key: Option<[u8; 32]>,
        bus: Arc<TopicBus>,
    ) -> Result<Arc<Self>, BusError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        let node_id = Uuid::new_v4().to_string();
        info!(node_id = %node_id, "broker: connected");

        let broker = Arc::new(Self {
            node_id: node_id.clone(),
            key,
            connection: Mutex::new(connection),
        });

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(BROKER_CHANNEL).await?;
        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "broker: unreadable payload");
                        continue;
                    }
                };
                let plain = match unseal(key.as_ref(), &payload) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "broker: rejected sealed payload");
                        continue;
                    }
                };
                let envelope: Envelope = match serde_json::from_slice(&plain) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "broker: malformed envelope");
                        continue;
                    }
                };
                if envelope.node == node_id {
                    continue;
                }
                let event = Arc::new(BusEvent {
                    kind: known_kind(&envelope.kind),
                    frame: envelope.frame,
                    critical: envelope.critical,
                });
                bus.publish_local(&envelope.topic, &event).await;
            }
            warn!("broker: inbound stream closed");
        });

        Ok(broker)
    }
}

/// Map a wire kind back onto its static name; unknown kinds from newer
/// nodes degrade to a placeholder rather than being dropped.
fn known_kind(kind: &str) -> &'static str {
    const KINDS: &[&str] = &[
        "chat.message",
        "typing.indicator",
        "status.update",
        "message.edited",
        "message.deleted",
        "message.reaction",
        "presence.update",
        "call.initiated",
        "call.incoming",
        "call.accepted",
        "call.rejected",
        "call.offer",
        "call.answer",
        "call.ice_candidate",
        "call.ended",
        "call.participant_update",
        "security.alert",
    ];
    KINDS.iter().find(|k| **k == kind).copied().unwrap_or("unknown")
}

#[async_trait]
impl Broker for RedisBroker {
    async fn forward(&self, topic: &str, event: &BusEvent) -> Result<(), BusError> {
        let envelope = Envelope {
            node: self.node_id.clone(),
            topic: topic.to_string(),
            kind: event.kind.to_string(),
            critical: event.critical,
            frame: event.frame.clone(),
        };
        let sealed = seal(self.key.as_ref(), &serde_json::to_vec(&envelope)?)?;
        let mut connection = self.connection.lock().await;
        let _: () = redis::cmd("PUBLISH")
            .arg(BROKER_CHANNEL)
            .arg(sealed)
            .query_async(&mut *connection)
            .await?;
        Ok(())
    }
}

// ── In-memory hub (tests, single-binary multi-bus setups) ───────────────────

/// Loopback "fleet": every attached bus sees every other bus's events.
#[derive(Default)]
pub struct InMemoryHub {
    nodes: Mutex<Vec<(String, Arc<TopicBus>)>>,
}

impl InMemoryHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a bus; returns the broker to install on it.
    pub async fn attach(self: &Arc<Self>, bus: Arc<TopicBus>) -> Arc<InMemoryBroker> {
        let node_id = Uuid::new_v4().to_string();
        self.nodes.lock().await.push((node_id.clone(), bus));
        Arc::new(InMemoryBroker {
            hub: Arc::clone(self),
            node_id,
        })
    }
}

pub struct InMemoryBroker {
    hub: Arc<InMemoryHub>,
    node_id: String,
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn forward(&self, topic: &str, event: &BusEvent) -> Result<(), BusError> {
        let nodes = self.hub.nodes.lock().await;
        for (node_id, bus) in nodes.iter() {
            if node_id == &self.node_id {
                continue;
            }
            let replay = Arc::new(BusEvent {
                kind: event.kind,
                frame: event.frame.clone(),
                critical: event.critical,
            });
            bus.publish_local(topic, &replay).await;
        }
        Ok(())
    }
}
