//! # Wire protocol
//!
//! Defines every message exchanged between the tunnel server and a remote
//! client over the control channel, plus the small set of helpers both sides
//! need to frame binary payloads as base64 inside JSON text frames.
//!
//! Kept in its own crate so the server and client binaries can never drift
//! out of sync on the message shape — both depend on this one definition.

use serde::{Deserialize, Serialize};

/// Maximum bytes read per iteration from a public TCP socket before being
/// framed as a `stream_data` message.
pub const TCP_READ_CHUNK: usize = 8192;

/// Maximum bytes read per UDP datagram.
pub const UDP_READ_CHUNK: usize = 65535;

/// How long a TCP connection may sit idle on read before the handler polls
/// its `active` flag again. Not fatal on its own.
pub const TCP_READ_TIMEOUT_SECS: u64 = 300;

/// UDP sessions idle longer than this are garbage-collected.
pub const UDP_SESSION_IDLE_TIMEOUT_SECS: u64 = 120;

/// How often listener accept/recv loops wake up to check their stop flag.
pub const LISTENER_POLL_INTERVAL_SECS: u64 = 1;

/// Which transport(s) a tunnel forwards.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn wants_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Both)
    }

    pub fn wants_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::Both)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Both => "BOTH",
        };
        f.write_str(s)
    }
}

/// All messages exchanged over the control channel.
///
/// Serialized with serde's internally-tagged representation: each variant
/// becomes a JSON object with a `"type"` field holding the snake_case
/// variant name, e.g. `ControlMessage::TunnelAuth` serializes to
/// `{"type": "tunnel_auth", ...}`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// C→S: request to authenticate a tunnel and bring it online.
    TunnelAuth {
        token: String,
        tunnel_id: i64,
        local_port: u16,
    },

    /// S→C: outcome of `TunnelAuth`.
    AuthResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        public_port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<Protocol>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        verification_url: Option<String>,
    },

    /// S→C: a new public TCP connection was accepted for this tunnel.
    NewConnection {
        conn_id: String,
        tunnel_id: i64,
        protocol: Protocol,
    },

    /// S→C: a chunk of bytes read from the public TCP socket.
    StreamData {
        conn_id: String,
        data: String,
        protocol: Protocol,
    },

    /// C→S: a chunk of bytes to write back to the public TCP socket.
    StreamResponse { conn_id: String, data: String },

    /// S↔C: either side is done with this connection.
    CloseConnection { conn_id: String },

    /// S→C: a UDP datagram arrived for this session.
    UdpPacket {
        session_id: String,
        data: String,
        tunnel_id: i64,
        addr: String,
    },

    /// C→S: a UDP datagram to send back to the public peer.
    UdpResponse { session_id: String, data: String },
}

/// Base64-encodes a byte chunk for embedding in a JSON text frame.
pub fn encode_payload(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.encode(bytes)
}

/// Decodes a base64 payload back into raw bytes.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    STANDARD.decode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_payload() {
        let data = b"\x00\x01ping\xffbinary garbage\n";
        let encoded = encode_payload(data);
        let decoded = decode_payload(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn tunnel_auth_serializes_with_type_tag() {
        let msg = ControlMessage::TunnelAuth {
            token: "abc".into(),
            tunnel_id: 7,
            local_port: 3000,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"tunnel_auth\""));
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        match back {
            ControlMessage::TunnelAuth {
                tunnel_id,
                local_port,
                ..
            } => {
                assert_eq!(tunnel_id, 7);
                assert_eq!(local_port, 3000);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn auth_response_omits_absent_optionals() {
        let msg = ControlMessage::AuthResponse {
            success: false,
            public_port: None,
            protocol: None,
            message: None,
            error: Some("Tunnel not verified".into()),
            verification_url: Some("/verify/abc123".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("public_port"));
        assert!(json.contains("Tunnel not verified"));
    }

    #[test]
    fn protocol_flags() {
        assert!(Protocol::Both.wants_tcp());
        assert!(Protocol::Both.wants_udp());
        assert!(Protocol::Tcp.wants_tcp());
        assert!(!Protocol::Tcp.wants_udp());
        assert!(!Protocol::Udp.wants_tcp());
    }
}
