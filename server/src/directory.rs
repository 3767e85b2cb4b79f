//! # Tunnel directory — the administrative surface consumed
//!
//! spec.md places tunnel CRUD, persistence, and the verification-code flow
//! out of scope, as external collaborators. The core consumes from them only
//! a set of authorized `{tunnel_id, token, local_port, public_port,
//! protocol}` records and a `verified` flag, through the hooks named in
//! spec.md §6: `lookup_tunnel`, `mark_active`, `mark_inactive`,
//! `list_active_tunnels`.
//!
//! [`TunnelDirectory`] is that seam. [`InMemoryDirectory`] is a minimal
//! implementation — enough to run the server and its tests — standing in for
//! whatever real persistence layer (e.g. the relational store named in
//! spec.md §2) is wired in by the binary that embeds this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tunnel_protocol::Protocol;

/// A tunnel's metadata, as owned by the administrative surface.
/// The core mutates only `status` and `last_connected`, via `mark_active`/
/// `mark_inactive`.
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: i64,
    pub token: String,
    pub local_port: u16,
    pub public_port: u16,
    pub protocol: Protocol,
    pub verified: bool,
    pub verification_code: String,
    pub status: TunnelStatus,
    pub last_connected: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Inactive,
    Active,
}

pub trait TunnelDirectory: Send + Sync {
    /// `lookup_tunnel(tunnel_id, token) -> record | nil`
    fn lookup(&self, tunnel_id: i64, token: &str) -> Option<TunnelRecord>;

    /// `mark_active(tunnel_id, timestamp)`
    fn mark_active(&self, tunnel_id: i64, timestamp: u64);

    /// `mark_inactive(tunnel_id)`
    fn mark_inactive(&self, tunnel_id: i64);

    /// `list_active_tunnels()` for observability.
    fn list_active_tunnels(&self) -> Vec<TunnelRecord>;
}

/// In-memory `TunnelDirectory`, seeded up front. Good enough to run the
/// server standalone and in tests; a real deployment would back this trait
/// with the relational store instead.
pub struct InMemoryDirectory {
    records: Mutex<HashMap<i64, TunnelRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: TunnelRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelDirectory for InMemoryDirectory {
    fn lookup(&self, tunnel_id: i64, token: &str) -> Option<TunnelRecord> {
        let records = self.records.lock().unwrap();
        records
            .get(&tunnel_id)
            .filter(|r| r.token == token)
            .cloned()
    }

    fn mark_active(&self, tunnel_id: i64, timestamp: u64) {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.get_mut(&tunnel_id) {
            r.status = TunnelStatus::Active;
            r.last_connected = Some(timestamp);
        }
    }

    fn mark_inactive(&self, tunnel_id: i64) {
        let mut records = self.records.lock().unwrap();
        if let Some(r) = records.get_mut(&tunnel_id) {
            r.status = TunnelStatus::Inactive;
        }
    }

    fn list_active_tunnels(&self) -> Vec<TunnelRecord> {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == TunnelStatus::Active)
            .cloned()
            .collect()
    }
}

/// Seconds since the Unix epoch, for `last_connected` stamping.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64) -> TunnelRecord {
        TunnelRecord {
            id,
            token: format!("token-{id}"),
            local_port: 3000,
            public_port: 10000 + id as u16,
            protocol: Protocol::Tcp,
            verified: true,
            verification_code: format!("code-{id}"),
            status: TunnelStatus::Inactive,
            last_connected: None,
        }
    }

    #[test]
    fn lookup_requires_matching_token() {
        let dir = InMemoryDirectory::new();
        dir.insert(sample(1));
        assert!(dir.lookup(1, "token-1").is_some());
        assert!(dir.lookup(1, "wrong").is_none());
        assert!(dir.lookup(2, "token-1").is_none());
    }

    #[test]
    fn mark_active_then_inactive_round_trips_status() {
        let dir = InMemoryDirectory::new();
        dir.insert(sample(1));
        dir.mark_active(1, 1000);
        assert_eq!(dir.list_active_tunnels().len(), 1);
        dir.mark_inactive(1);
        assert_eq!(dir.list_active_tunnels().len(), 0);
    }
}
