//! # Tunnel Client
//!
//! The remote side of a reverse tunnel: connects outbound to a tunnel
//! server's control channel, authenticates one tunnel, and relays traffic
//! the server demuxes back to it against a single local service.
//!
//! Grounded on `client/src-tauri/src/lib.rs`'s setup sequence (logging
//! init, then spawn the connection loop), with the Tauri app/IPC/window
//! plumbing stripped since this client has no GUI surface (spec.md §2:
//! the Remote Client is the counterpart the server's Control Channel
//! Adapter and Authenticator talk to, not a product in its own right).

mod config;
mod relay;
mod state;

mod agent;

use clap::Parser;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::state::ClientState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_client=info".into()),
        )
        .init();

    let config = Arc::new(ClientConfig::parse());
    let state = Arc::new(ClientState::new());

    agent::run_client_loop(config, state).await;
}
