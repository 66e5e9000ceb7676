//! HTTP + WebSocket gateway: the session router, REST surface, request
//! throttling, and the maintenance scheduler.

pub mod auth;
pub mod error;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod state;
pub mod throttle;
pub mod ws;

pub use {server::serve, state::AppState};
