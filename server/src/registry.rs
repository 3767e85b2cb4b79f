//! # Connection Registry (spec.md §4.5)
//!
//! A single process-wide map guarded by one mutex. spec.md is explicit that
//! this is a deliberate choice, not an oversight: contention here is
//! dominated by per-message control-channel traffic, not map operations, and
//! per-shard locking would complicate the ordering semantics across the
//! `mark_inactive` → `remove` boundary. If contention is ever observed in
//! practice, spec.md's own fallback is to shard by `conn_id` hash without
//! changing the externally observable ordering — not to reach for a
//! lock-free map.
//!
//! Handler loops must re-check `active` under lock before every write to an
//! owned socket, to avoid writing to a socket the tear-down path has already
//! closed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

pub type ConnId = String;
pub type SessionId = String;

/// Per-TCP-connection record (spec.md §3).
pub struct ConnectionEntry {
    pub tunnel_id: i64,
    /// Exclusive owner of the write half; the read half lives in the
    /// TCP Stream Handler task that inserted this entry.
    pub write_half: Arc<AsyncMutex<OwnedWriteHalf>>,
    pub active: bool,
}

/// Per-UDP-session record (spec.md §3). `socket` is a non-owning clone of
/// the UDP Listener Worker's shared listening socket — per spec.md §9, the
/// close path for a session entry must never close this socket, since many
/// sessions share it.
pub struct UdpSessionEntry {
    pub tunnel_id: i64,
    pub socket: Arc<UdpSocket>,
    pub peer_addr: SocketAddr,
    pub active: bool,
}

enum Entry {
    Tcp(ConnectionEntry),
    Udp(UdpSessionEntry),
}

/// The Connection Registry. One instance is shared (via `Arc`) across every
/// Listener Worker and Stream Handler in the process.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_tcp(&self, conn_id: ConnId, entry: ConnectionEntry) {
        self.entries.lock().unwrap().insert(conn_id, Entry::Tcp(entry));
    }

    pub fn insert_udp(&self, session_id: SessionId, entry: UdpSessionEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(session_id, Entry::Udp(entry));
    }

    /// Returns the write half and whether the entry is still active, without
    /// holding the registry lock across the caller's subsequent socket
    /// write (per spec.md §5's deadlock-avoidance rule: never call into I/O
    /// while holding this lock).
    pub fn tcp_write_half(&self, conn_id: &str) -> Option<(Arc<AsyncMutex<OwnedWriteHalf>>, bool)> {
        let entries = self.entries.lock().unwrap();
        match entries.get(conn_id) {
            Some(Entry::Tcp(e)) => Some((e.write_half.clone(), e.active)),
            _ => None,
        }
    }

    pub fn udp_target(&self, session_id: &str) -> Option<(Arc<UdpSocket>, SocketAddr)> {
        let entries = self.entries.lock().unwrap();
        match entries.get(session_id) {
            Some(Entry::Udp(e)) if e.active => Some((e.socket.clone(), e.peer_addr)),
            _ => None,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(id) {
            Some(Entry::Tcp(e)) => e.active,
            Some(Entry::Udp(e)) => e.active,
            None => false,
        }
    }

    pub fn mark_inactive(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(id) {
            Some(Entry::Tcp(e)) => e.active = false,
            Some(Entry::Udp(e)) => e.active = false,
            None => {}
        }
    }

    /// Removes the entry if present. A no-op if it's already gone — this is
    /// what makes a duplicate `close_connection` for the same id a no-op,
    /// per spec.md §8.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().unwrap().remove(id).is_some()
    }

    /// Forcibly closes and removes every entry belonging to `tunnel_id`.
    /// Used by `stop_listener` and on `ControlChannelLost`.
    pub fn remove_where_tunnel(&self, tunnel_id: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let to_remove: Vec<String> = entries
            .iter()
            .filter(|(_, e)| match e {
                Entry::Tcp(c) => c.tunnel_id == tunnel_id,
                Entry::Udp(u) => u.tunnel_id == tunnel_id,
            })
            .map(|(k, _)| k.clone())
            .collect();
        let count = to_remove.len();
        for id in to_remove {
            entries.remove(&id);
        }
        count
    }

    pub fn active_count_for_tunnel(&self, tunnel_id: i64) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .filter(|e| {
                let (tid, active) = match e {
                    Entry::Tcp(c) => (c.tunnel_id, c.active),
                    Entry::Udp(u) => (u.tunnel_id, u.active),
                };
                tid == tunnel_id && active
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_entry_lifecycle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::join!(connect, accept);
        let client = client.unwrap();
        let server = server.unwrap();
        drop(client);

        let (_read, write) = server.into_split();
        let registry = Registry::new();
        registry.insert_tcp(
            "conn-1".into(),
            ConnectionEntry {
                tunnel_id: 42,
                write_half: Arc::new(AsyncMutex::new(write)),
                active: true,
            },
        );

        assert!(registry.is_active("conn-1"));
        assert_eq!(registry.active_count_for_tunnel(42), 1);

        registry.mark_inactive("conn-1");
        assert!(!registry.is_active("conn-1"));

        assert!(registry.remove("conn-1"));
        assert!(!registry.remove("conn-1")); // duplicate remove is a no-op
        assert_eq!(registry.active_count_for_tunnel(42), 0);
    }

    #[test]
    fn remove_where_tunnel_only_touches_matching_entries() {
        let registry = Registry::new();
        // Use UDP entries since they don't need a live socket pair.
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            registry.insert_udp(
                "sess-a".into(),
                UdpSessionEntry {
                    tunnel_id: 1,
                    socket: sock.clone(),
                    peer_addr: "127.0.0.1:9".parse().unwrap(),
                    active: true,
                },
            );
            registry.insert_udp(
                "sess-b".into(),
                UdpSessionEntry {
                    tunnel_id: 2,
                    socket: sock,
                    peer_addr: "127.0.0.1:9".parse().unwrap(),
                    active: true,
                },
            );
            let removed = registry.remove_where_tunnel(1);
            assert_eq!(removed, 1);
            assert!(!registry.is_active("sess-a"));
            assert!(registry.is_active("sess-b"));
        });
    }
}
