//! # Observability endpoint
//!
//! A thin, read-only wrapper around `TunnelDirectory::list_active_tunnels`
//! (spec.md §6) — this is observability of the core, not the CRUD/dashboard
//! layer spec.md places out of scope. Grounded on `server/src/api.rs`'s
//! `list_agents` endpoint.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ActiveTunnelItem {
    pub id: i64,
    pub public_port: u16,
    pub local_port: u16,
    pub protocol: String,
    pub last_connected: Option<u64>,
}

/// `GET /api/tunnels` — returns every tunnel the directory considers active.
pub async fn list_active_tunnels(State(state): State<AppState>) -> Json<Vec<ActiveTunnelItem>> {
    let tunnels = state
        .directory
        .list_active_tunnels()
        .into_iter()
        .map(|t| ActiveTunnelItem {
            id: t.id,
            public_port: t.public_port,
            local_port: t.local_port,
            protocol: t.protocol.to_string(),
            last_connected: t.last_connected,
        })
        .collect();
    Json(tunnels)
}
