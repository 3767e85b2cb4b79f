//! # Server configuration
//!
//! Every knob in spec.md §6, overridable on the command line or via
//! `TUNNEL_*` environment variables (`clap`'s `env` feature).

use clap::Parser;
use std::ops::RangeInclusive;

#[derive(Debug, Clone, Parser)]
#[command(name = "tunnel-server", about = "Reverse tunnel relay server")]
pub struct Config {
    /// Interface the control channel HTTP/WS listener binds to.
    #[arg(long, env = "TUNNEL_CONTROL_HOST", default_value = "0.0.0.0")]
    pub control_host: String,

    /// Port the control channel HTTP/WS listener binds to.
    #[arg(long, env = "TUNNEL_CONTROL_PORT", default_value_t = 7070)]
    pub control_port: u16,

    /// Interface each tunnel's public listener binds to.
    #[arg(long, env = "TUNNEL_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: String,

    /// TCP accept() backlog for each tunnel's public listener.
    #[arg(long, env = "TUNNEL_ACCEPT_BACKLOG", default_value_t = 50)]
    pub accept_backlog: u32,

    /// Bytes read per iteration from a public TCP socket.
    #[arg(long, env = "TUNNEL_TCP_READ_CHUNK", default_value_t = tunnel_protocol::TCP_READ_CHUNK)]
    pub tcp_read_chunk: usize,

    /// Bytes read per UDP datagram.
    #[arg(long, env = "TUNNEL_UDP_READ_CHUNK", default_value_t = tunnel_protocol::UDP_READ_CHUNK)]
    pub udp_read_chunk: usize,

    /// Idle read timeout on a public TCP socket, in seconds.
    #[arg(long, env = "TUNNEL_TCP_READ_TIMEOUT", default_value_t = tunnel_protocol::TCP_READ_TIMEOUT_SECS)]
    pub tcp_read_timeout_secs: u64,

    /// UDP session idle-eviction threshold, in seconds.
    #[arg(long, env = "TUNNEL_UDP_SESSION_IDLE_TIMEOUT", default_value_t = tunnel_protocol::UDP_SESSION_IDLE_TIMEOUT_SECS)]
    pub udp_session_idle_timeout_secs: u64,

    /// How often accept/recv loops wake to check their stop flag, in seconds.
    #[arg(long, env = "TUNNEL_LISTENER_POLL_INTERVAL", default_value_t = tunnel_protocol::LISTENER_POLL_INTERVAL_SECS)]
    pub listener_poll_interval_secs: u64,

    /// Lower bound of the public port range minted for new tunnels.
    /// Informational here — port minting happens in the administrative
    /// surface — but the Tunnel Controller uses it to sanity-check requests.
    #[arg(long, env = "TUNNEL_PUBLIC_PORT_MIN", default_value_t = 10000)]
    pub public_port_min: u16,

    /// Upper bound of the public port range minted for new tunnels.
    #[arg(long, env = "TUNNEL_PUBLIC_PORT_MAX", default_value_t = 60000)]
    pub public_port_max: u16,
}

impl Config {
    pub fn public_port_range(&self) -> RangeInclusive<u16> {
        self.public_port_min..=self.public_port_max
    }

    pub fn listener_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.listener_poll_interval_secs)
    }

    pub fn tcp_read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tcp_read_timeout_secs)
    }

    pub fn udp_session_idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.udp_session_idle_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        // clap::Parser::parse_from is used here instead of deriving Default
        // manually so the defaults above stay the single source of truth.
        Config::parse_from::<_, String>(std::iter::once("tunnel-server".to_string()))
    }
}
