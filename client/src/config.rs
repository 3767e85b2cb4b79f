//! # Client configuration
//!
//! CLI args / `TUNNEL_*` environment variables for the one tunnel this
//! client process relays. Mirrors `server::config::Config`'s shape so both
//! binaries share the same operational conventions.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-client", about = "Relay a local service through a tunnel server")]
pub struct ClientConfig {
    /// WebSocket URL of the tunnel server's control channel.
    #[arg(long, env = "TUNNEL_SERVER_URL", default_value = "ws://127.0.0.1:7070/ws")]
    pub server_url: String,

    /// Auth token for this tunnel, issued by the administrative surface.
    #[arg(long, env = "TUNNEL_TOKEN")]
    pub token: String,

    /// The tunnel's identifier, issued by the administrative surface.
    #[arg(long, env = "TUNNEL_ID")]
    pub tunnel_id: i64,

    /// Host the locally-tunneled service listens on.
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "127.0.0.1")]
    pub local_host: String,

    /// Port the locally-tunneled service listens on.
    #[arg(long, env = "TUNNEL_LOCAL_PORT")]
    pub local_port: u16,
}
