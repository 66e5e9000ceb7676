//! Topic Bus: in-process pub/sub with bounded per-subscriber queues, plus
//! an optional cross-node broker.
//!
//! Topics are flat strings (`user_1`, `conv_<uuid>`, ...). A session
//! registers once, subscribes to any number of topics, and drains a single
//! bounded queue from its socket write loop. Publishing never blocks: when
//! a subscriber's queue is full the oldest non-critical event is dropped,
//! counted, and logged. Events published by one task to one topic reach
//! each subscriber in publish order; nothing is guaranteed across topics.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    tokio::sync::{Mutex, Notify, RwLock},
    tracing::{debug, warn},
};

use sotto_protocol::{ServerEvent, TOPIC_QUEUE_CAPACITY};

pub mod broker;
pub mod error;

pub use {
    broker::{Broker, InMemoryHub, RedisBroker},
    error::BusError,
};

// ── Events ───────────────────────────────────────────────────────────────────

/// A serialized event in flight. The frame is serialized once per publish
/// and shared by reference across subscribers.
#[derive(Debug)]
pub struct BusEvent {
    pub kind: &'static str,
    pub frame: String,
    pub critical: bool,
}

impl BusEvent {
    pub fn from_event(event: &ServerEvent) -> Result<Arc<Self>, BusError> {
        Ok(Arc::new(Self {
            kind: event.kind(),
            frame: serde_json::to_string(event)?,
            critical: event.is_critical(),
        }))
    }
}

// ── Per-session queue ────────────────────────────────────────────────────────

struct SessionQueue {
    events: Mutex<VecDeque<Arc<BusEvent>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicU64,
}

impl SessionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Overflow evicts the oldest non-critical
    /// event; critical events are never the victim and may exceed capacity.
    async fn push(&self, event: Arc<BusEvent>) {
        let mut events = self.events.lock().await;
        if events.len() >= self.capacity {
            if let Some(victim) = events.iter().position(|e| !e.critical) {
                let evicted = events.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("bus_events_dropped").increment(1);
                if let Some(evicted) = evicted {
                    warn!(kind = evicted.kind, "bus: subscriber queue full, dropped event");
                }
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Arc<BusEvent>> {
        loop {
            // Arm the notification before checking the queue so a push (or
            // close) landing in between cannot be missed.
            let notified = self.notify.notified();
            {
                let mut events = self.events.lock().await;
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::Acquire) != 0 {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(1, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// A registered session's receive side, drained by its write loop.
pub struct SessionHandle {
    pub session_id: String,
    queue: Arc<SessionQueue>,
}

impl SessionHandle {
    /// Next event, in per-topic publish order. Returns `None` once the
    /// session has been removed from the bus.
    pub async fn recv(&self) -> Option<Arc<BusEvent>> {
        self.queue.pop().await
    }

    /// Events dropped on this session's queue since registration.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

// ── The bus ──────────────────────────────────────────────────────────────────

pub struct TopicBus {
    topics: RwLock<HashMap<String, HashMap<String, Arc<SessionQueue>>>>,
    sessions: RwLock<HashMap<String, Arc<SessionQueue>>>,
    broker: RwLock<Option<Arc<dyn Broker>>>,
    queue_capacity: usize,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(TOPIC_QUEUE_CAPACITY)
    }
}

impl TopicBus {
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            broker: RwLock::new(None),
            queue_capacity,
        }
    }

    /// Attach the cross-node broker. Done after construction because the
    /// broker's inbound loop needs a handle back to the bus.
    pub async fn set_broker(&self, broker: Arc<dyn Broker>) {
        *self.broker.write().await = Some(broker);
    }

    pub async fn register_session(&self, session_id: impl Into<String>) -> SessionHandle {
        let session_id = session_id.into();
        let queue = Arc::new(SessionQueue::new(self.queue_capacity));
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), Arc::clone(&queue));
        debug!(session_id = %session_id, "bus: session registered");
        SessionHandle { session_id, queue }
    }

    /// Remove a session everywhere and wake its drain loop for shutdown.
    pub async fn remove_session(&self, session_id: &str) {
        let queue = self.sessions.write().await.remove(session_id);
        let mut topics = self.topics.write().await;
        topics.retain(|_, subscribers| {
            subscribers.remove(session_id);
            !subscribers.is_empty()
        });
        drop(topics);
        if let Some(queue) = queue {
            queue.close();
        }
        debug!(session_id = %session_id, "bus: session removed");
    }

    /// Idempotent topic membership.
    pub async fn subscribe(&self, topic: &str, session_id: &str) {
        let Some(queue) = self.sessions.read().await.get(session_id).cloned() else {
            warn!(session_id = %session_id, topic, "bus: subscribe for unknown session");
            return;
        };
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(session_id.to_string(), queue);
    }

    pub async fn unsubscribe(&self, topic: &str, session_id: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(session_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Fan out to every live local subscriber and forward across the fleet.
    pub async fn publish(&self, topic: &str, event: &ServerEvent) -> Result<(), BusError> {
        let bus_event = BusEvent::from_event(event)?;
        self.publish_local(topic, &bus_event).await;

        if let Some(broker) = self.broker.read().await.as_ref() {
            if let Err(e) = broker.forward(topic, &bus_event).await {
                warn!(topic, error = %e, "bus: broker forward failed");
            }
        }
        Ok(())
    }

    /// Local-only fan-out; the broker inbound loop lands here so remote
    /// events are not re-forwarded.
    pub async fn publish_local(&self, topic: &str, event: &Arc<BusEvent>) {
        let subscribers: Vec<Arc<SessionQueue>> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(subscribers) => subscribers.values().cloned().collect(),
                None => return,
            }
        };
        for queue in subscribers {
            queue.push(Arc::clone(event)).await;
        }
    }

    /// Direct delivery to one session, bypassing topics.
    pub async fn send_to_session(&self, session_id: &str, event: &ServerEvent) -> Result<(), BusError> {
        let queue = self.sessions.read().await.get(session_id).cloned();
        if let Some(queue) = queue {
            queue.push(BusEvent::from_event(event)?).await;
        }
        Ok(())
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map_or(0, HashMap::len)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, sotto_protocol::*, uuid::Uuid};

    fn typing_event(user_id: i64) -> ServerEvent {
        ServerEvent::TypingIndicator(TypingWire {
            conversation_id: Uuid::nil(),
            user_id,
            is_typing: true,
            is_recording: false,
        })
    }

    fn critical_event() -> ServerEvent {
        ServerEvent::CallEnded(CallEndedWire {
            call_id: Uuid::new_v4(),
            ended_by: 1,
            duration_secs: 10,
        })
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_in_order() {
        let bus = TopicBus::default();
        let handle = bus.register_session("s1").await;
        bus.subscribe("conv_x", "s1").await;

        for i in 0..5 {
            bus.publish("conv_x", &typing_event(i)).await.unwrap();
        }
        for i in 0..5 {
            let event = handle.recv().await.unwrap();
            let parsed: serde_json::Value = serde_json::from_str(&event.frame).unwrap();
            assert_eq!(parsed["user_id"], i);
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_single_delivery() {
        let bus = TopicBus::default();
        let handle = bus.register_session("s1").await;
        bus.subscribe("conv_x", "s1").await;
        bus.subscribe("conv_x", "s1").await;

        bus.publish("conv_x", &typing_event(1)).await.unwrap();
        bus.publish("conv_x", &typing_event(2)).await.unwrap();

        let first = handle.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&first.frame).unwrap();
        assert_eq!(parsed["user_id"], 1);
    }

    #[tokio::test]
    async fn unsubscribed_sessions_stop_receiving() {
        let bus = TopicBus::default();
        let handle = bus.register_session("s1").await;
        bus.subscribe("conv_x", "s1").await;
        bus.unsubscribe("conv_x", "s1").await;
        assert_eq!(bus.subscriber_count("conv_x").await, 0);

        bus.publish("conv_x", &typing_event(1)).await.unwrap();
        bus.send_to_session("s1", &typing_event(9)).await.unwrap();
        let event = handle.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&event.frame).unwrap();
        assert_eq!(parsed["user_id"], 9);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_critical_only() {
        let bus = TopicBus::new(4);
        let handle = bus.register_session("s1").await;
        bus.subscribe("user_1", "s1").await;

        bus.publish("user_1", &critical_event()).await.unwrap();
        for i in 0..4 {
            bus.publish("user_1", &typing_event(i)).await.unwrap();
        }
        // Queue was full on the last publish: typing(0) is the victim, the
        // critical event survives at the head.
        assert_eq!(handle.dropped_events(), 1);

        let first = handle.recv().await.unwrap();
        assert!(first.critical);
        let second = handle.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&second.frame).unwrap();
        assert_eq!(parsed["user_id"], 1);
    }

    #[tokio::test]
    async fn removed_session_drains_to_none() {
        let bus = TopicBus::default();
        let handle = bus.register_session("s1").await;
        bus.subscribe("conv_x", "s1").await;
        bus.remove_session("s1").await;
        assert!(handle.recv().await.is_none());
    }
}
