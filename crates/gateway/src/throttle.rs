//! Fixed-window request throttling by client IP and endpoint scope.
//!
//! Login attempts get the tightest budget; WebSocket upgrades are limited
//! to damp reconnect storms. Per-user hourly limits for key-service
//! endpoints live in the database instead (see `AppState::check_user_rate`)
//! so they hold across nodes.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    axum::{
        extract::{ConnectInfo, State},
        http::{Method, StatusCode},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    dashmap::{DashMap, mapref::entry::Entry},
    serde_json::json,
};

use crate::state::AppState;

const CLEANUP_EVERY_REQUESTS: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Scope {
    Login,
    Auth,
    Api,
    Ws,
}

impl Scope {
    fn of(method: &Method, path: &str) -> Self {
        if path == "/auth/login" && method == Method::POST {
            Self::Login
        } else if path.starts_with("/auth/") {
            Self::Auth
        } else if path.starts_with("/ws/") {
            Self::Ws
        } else {
            Self::Api
        }
    }

    fn limit(self) -> (usize, Duration) {
        match self {
            // Brute-force protection on password attempts.
            Self::Login => (5, Duration::from_secs(60)),
            Self::Auth => (60, Duration::from_secs(60)),
            Self::Api => (180, Duration::from_secs(60)),
            // Reconnect storms.
            Self::Ws => (30, Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    ip: IpAddr,
    scope: Scope,
}

#[derive(Clone, Copy)]
struct Window {
    started_at: Instant,
    count: usize,
}

#[derive(Clone, Default)]
pub struct RequestThrottle {
    buckets: Arc<DashMap<Key, Window>>,
    seen: Arc<AtomicU64>,
}

impl RequestThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `Ok` to proceed, or the seconds to wait.
    fn check(&self, ip: IpAddr, scope: Scope, now: Instant) -> Result<(), u64> {
        let (max_requests, window) = scope.limit();
        let decision = match self.buckets.entry(Key { ip, scope }) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                let elapsed = now.duration_since(state.started_at);
                if elapsed >= window {
                    state.started_at = now;
                    state.count = 1;
                    Ok(())
                } else if state.count < max_requests {
                    state.count += 1;
                    Ok(())
                } else {
                    Err(window.saturating_sub(elapsed).as_secs().max(1))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Window {
                    started_at: now,
                    count: 1,
                });
                Ok(())
            }
        };
        self.cleanup_if_due(now);
        decision
    }

    fn cleanup_if_due(&self, now: Instant) {
        if self.seen.fetch_add(1, Ordering::Relaxed) % CLEANUP_EVERY_REQUESTS != 0 {
            return;
        }
        self.buckets.retain(|key, window| {
            now.duration_since(window.started_at) < key.scope.limit().1 * 2
        });
    }
}

pub async fn throttle_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let scope = Scope::of(request.method(), request.uri().path());
    match state.throttle.check(addr.ip(), scope, Instant::now()) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                axum::Json(json!({ "error": "too many requests" })),
            )
                .into_response();
            if let Ok(value) = retry_after.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
            response
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_budget_is_five_per_minute() {
        let throttle = RequestThrottle::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let now = Instant::now();
        for _ in 0..5 {
            assert!(throttle.check(ip, Scope::Login, now).is_ok());
        }
        assert!(throttle.check(ip, Scope::Login, now).is_err());
        // A fresh window readmits.
        assert!(
            throttle
                .check(ip, Scope::Login, now + Duration::from_secs(61))
                .is_ok()
        );
    }

    #[test]
    fn scopes_and_ips_are_independent() {
        let throttle = RequestThrottle::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let now = Instant::now();
        for _ in 0..5 {
            throttle.check(a, Scope::Login, now).unwrap();
        }
        assert!(throttle.check(a, Scope::Login, now).is_err());
        assert!(throttle.check(a, Scope::Api, now).is_ok());
        assert!(throttle.check(b, Scope::Login, now).is_ok());
    }

    #[test]
    fn scope_routing() {
        assert_eq!(Scope::of(&Method::POST, "/auth/login"), Scope::Login);
        assert_eq!(Scope::of(&Method::POST, "/auth/register"), Scope::Auth);
        assert_eq!(Scope::of(&Method::GET, "/ws/chat"), Scope::Ws);
        assert_eq!(Scope::of(&Method::GET, "/chat/conversations"), Scope::Api);
    }
}
