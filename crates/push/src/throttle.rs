//! Duplicate-notification suppression.
//!
//! Keys hash (recipient, type, source) with md5 and live in a per-node
//! in-process cache for 30 seconds. This cache must never be consulted by
//! another node; each node suppresses its own duplicates only.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use sotto_protocol::PUSH_THROTTLE_WINDOW_SECS;

const CLEANUP_EVERY_CHECKS: u64 = 512;

/// Cache key: `md5(recipient:type:source_type:source_id)`.
#[must_use]
pub fn key(recipient_id: i64, notification_type: &str, source_type: &str, source_id: &str) -> String {
    let raw = format!("notif_throttle:{recipient_id}:{notification_type}:{source_type}:{source_id}");
    format!("{:x}", md5::compute(raw.as_bytes()))
}

pub struct ThrottleCache {
    entries: DashMap<String, Instant>,
    window: Duration,
    checks: AtomicU64,
}

impl Default for ThrottleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(PUSH_THROTTLE_WINDOW_SECS))
    }

    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            checks: AtomicU64::new(0),
        }
    }

    /// Returns true when the key was already seen inside the window;
    /// otherwise records it and returns false.
    pub fn check_and_insert(&self, key: &str) -> bool {
        let now = Instant::now();
        let seen = match self.entries.get(key) {
            Some(entry) => now.duration_since(*entry) < self.window,
            None => false,
        };
        if !seen {
            self.entries.insert(key.to_string(), now);
        }
        self.cleanup_if_due(now);
        seen
    }

    fn cleanup_if_due(&self, now: Instant) {
        if self.checks.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY_CHECKS != 0 {
            return;
        }
        let window = self.window;
        self.entries
            .retain(|_, inserted| now.duration_since(*inserted) < window);
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_inside_window_is_suppressed() {
        let cache = ThrottleCache::new();
        let k = key(1, "new_message", "conversation", "c1");
        assert!(!cache.check_and_insert(&k));
        assert!(cache.check_and_insert(&k));
    }

    #[test]
    fn different_sources_do_not_collide() {
        let cache = ThrottleCache::new();
        assert!(!cache.check_and_insert(&key(1, "new_message", "conversation", "c1")));
        assert!(!cache.check_and_insert(&key(1, "new_message", "conversation", "c2")));
        assert!(!cache.check_and_insert(&key(2, "new_message", "conversation", "c1")));
    }

    #[test]
    fn window_expiry_readmits() {
        let cache = ThrottleCache::with_window(Duration::from_millis(0));
        let k = key(1, "new_message", "conversation", "c1");
        assert!(!cache.check_and_insert(&k));
        // Zero window: the previous sighting has already aged out.
        assert!(!cache.check_and_insert(&k));
    }

    #[test]
    fn key_is_a_stable_md5_hex() {
        let k = key(1, "new_message", "conversation", "c1");
        assert_eq!(k.len(), 32);
        assert_eq!(k, key(1, "new_message", "conversation", "c1"));
    }
}
