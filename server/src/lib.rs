//! # Tunnel Data Plane core
//!
//! Everything the `tunnel-server` binary wires together, split into a
//! library so integration tests can drive a real [`app`] without going
//! through a spawned process. Grounded on `firezone-relay`'s `lib.rs`/`main.rs`
//! split in the broader example corpus — the reference tunnel project in this
//! workspace's own teacher never separated the two, but its binary has no
//! tests at all; this workspace's `tests/` suite needs the router and state
//! constructors to be importable.

pub mod api;
pub mod authenticator;
pub mod config;
pub mod control_channel;
pub mod controller;
pub mod directory;
pub mod error;
pub mod registry;
pub mod state;
pub mod tcp_listener;
pub mod udp_listener;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Builds the control channel's axum app: `/ws` for the Control Channel
/// Adapter, `/api/tunnels` for the read-only observability endpoint.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(control_channel::ws_handler))
        .route("/api/tunnels", get(api::list_active_tunnels))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
