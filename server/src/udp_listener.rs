//! # UDP Listener Worker (spec.md §4.4)
//!
//! Bound for datagrams with address reuse, recv loop with a 1s timeout, and
//! a peer-addr-keyed session table owned exclusively by this task (no
//! external access, per spec.md §5's "Shared resources" list). Grounded
//! almost line-for-line on `original_source/proxy_server.py::_udp_proxy_worker`
//! — same session-key shape (`"ip:port"`), same inline sweep-after-insert,
//! same 120s idle constant.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::info;
use tunnel_protocol::{encode_payload, ControlMessage};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::{Registry, UdpSessionEntry};
use crate::state::TunnelSessions;

struct UdpSession {
    session_id: String,
    last_activity: Instant,
}

/// Runs the recv loop for one tunnel's public UDP port until the stop flag
/// is set.
pub async fn run(
    socket: UdpSocket,
    tunnel_id: i64,
    registry: Arc<Registry>,
    sessions: Arc<TunnelSessions>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
) {
    let socket = Arc::new(socket);
    let poll_interval = config.listener_poll_interval();
    let idle_timeout = config.udp_session_idle_timeout();
    let mut table: HashMap<SocketAddr, UdpSession> = HashMap::new();
    let mut buf = vec![0u8; config.udp_read_chunk];

    info!(tunnel_id, "udp listener recv loop starting");

    while !stop.load(Ordering::SeqCst) {
        let recv = timeout(poll_interval, socket.recv_from(&mut buf)).await;
        let (n, peer_addr) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(_e)) => continue,
            Err(_elapsed) => {
                sweep(&mut table, &registry, idle_timeout);
                continue;
            }
        };

        let Some(session) = sessions.get(tunnel_id) else {
            continue; // tunnel not authenticated (any more); drop silently
        };

        let session_id = match table.get_mut(&peer_addr) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                entry.session_id.clone()
            }
            None => {
                let session_id = Uuid::new_v4().to_string();
                table.insert(
                    peer_addr,
                    UdpSession {
                        session_id: session_id.clone(),
                        last_activity: Instant::now(),
                    },
                );
                registry.insert_udp(
                    session_id.clone(),
                    UdpSessionEntry {
                        tunnel_id,
                        socket: socket.clone(),
                        peer_addr,
                        active: true,
                    },
                );
                info!(tunnel_id, session_id, %peer_addr, "new udp session");
                session_id
            }
        };

        let data = encode_payload(&buf[..n]);
        let _ = session.tx.send(ControlMessage::UdpPacket {
            session_id,
            data,
            tunnel_id,
            addr: peer_addr.to_string(),
        });

        sweep(&mut table, &registry, idle_timeout);
    }

    for entry in table.values() {
        registry.remove(&entry.session_id);
    }
    info!(tunnel_id, "udp listener recv loop stopped");
}

/// Removes sessions idle longer than `idle_timeout`, along with their
/// Registry entries. Never closes the shared listening socket (spec.md §9):
/// the socket is dropped only when the whole worker returns.
fn sweep(table: &mut HashMap<SocketAddr, UdpSession>, registry: &Registry, idle_timeout: std::time::Duration) {
    let now = Instant::now();
    let expired: Vec<SocketAddr> = table
        .iter()
        .filter(|(_, s)| now.duration_since(s.last_activity) > idle_timeout)
        .map(|(addr, _)| *addr)
        .collect();
    for addr in expired {
        if let Some(entry) = table.remove(&addr) {
            registry.remove(&entry.session_id);
            info!(session_id = entry.session_id, %addr, "udp session expired");
        }
    }
}
