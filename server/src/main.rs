//! # Tunnel Relay Server
//!
//! The server half of a reverse tunneling service: it exposes a public
//! TCP/UDP endpoint per authenticated tunnel and forwards traffic arriving
//! there to whatever service the remote client relays it to, over a single
//! persistent control channel the client initiates outbound.
//!
//! ## Architecture
//!
//! ```text
//! Public peer ──TCP/UDP──► Listener Worker ──► Registry ──► Control Channel ──► remote client
//! ```
//!
//! See `tunnel_server::lib` for the module breakdown; this binary only
//! parses configuration, seeds a demo tunnel, and serves the app it builds.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use tunnel_protocol::Protocol;
use tunnel_server::config::Config;
use tunnel_server::directory::{InMemoryDirectory, TunnelRecord, TunnelStatus};
use tunnel_server::state::AppState;

/// Server entry point.
///
/// Initializes logging, parses configuration, creates the shared state, and
/// starts the control channel's HTTP/WS listener. Each tunnel's own public
/// listener is started later, on successful authentication, by the
/// Authenticator via the Tunnel Controller.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_server=info".into()),
        )
        .init();

    let config = Config::parse();

    let directory = Arc::new(InMemoryDirectory::new());
    seed_demo_tunnel(&directory);

    let addr = SocketAddr::new(config.control_host.parse()?, config.control_port);
    let state = AppState::new(config, directory);
    let app = tunnel_server::app(state);

    info!("tunnel server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Seeds one demo tunnel so the binary is immediately useful without a real
/// administrative/persistence layer wired in. A production deployment backs
/// `TunnelDirectory` with the relational store instead (spec.md §2).
fn seed_demo_tunnel(directory: &InMemoryDirectory) {
    directory.insert(TunnelRecord {
        id: 1,
        token: "demo-token".into(),
        local_port: 7000,
        public_port: 10001,
        protocol: Protocol::Tcp,
        verified: true,
        verification_code: "demo-code".into(),
        status: TunnelStatus::Inactive,
        last_connected: None,
    });
}
