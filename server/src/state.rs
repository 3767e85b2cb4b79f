//! # Shared application state
//!
//! Holds the Connection Registry, the `connected_tunnels` index (live Tunnel
//! Sessions), the Tunnel Directory, the Tunnel Controller, and the server
//! `Config`. Built once in `main` and cloned (cheaply, via `Arc`) into every
//! axum handler and worker task — the reference server's own pattern,
//! generalized away from a process-global singleton per spec.md §9's design
//! note.
//!
//! The reference server used `DashMap` for lock-free concurrent registries.
//! spec.md §4.5/§5 explicitly prescribes a single mutex over one map for the
//! Connection Registry and the `connected_tunnels` index instead — contention
//! here is dominated by per-message control-channel I/O, not map operations
//! — so that design is followed here rather than the teacher's `DashMap`
//! habit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tunnel_protocol::{ControlMessage, Protocol};

use crate::config::Config;
use crate::controller::TunnelController;
use crate::directory::TunnelDirectory;
use crate::registry::Registry;

pub type ControlTx = mpsc::UnboundedSender<ControlMessage>;

/// A live Tunnel Session (spec.md §3): at most one per `tunnel_id`.
#[derive(Clone)]
pub struct TunnelSession {
    pub control_channel_id: String,
    pub tx: ControlTx,
    pub local_port: u16,
    pub public_port: u16,
    pub protocol: Protocol,
}

/// The `connected_tunnels` index (spec.md §2/§5): single mutex, written by
/// the Authenticator and the disconnect handler, read by Listener Workers
/// and Stream Handlers.
#[derive(Default)]
pub struct TunnelSessions {
    sessions: Mutex<HashMap<i64, TunnelSession>>,
}

impl TunnelSessions {
    pub fn get(&self, tunnel_id: i64) -> Option<TunnelSession> {
        self.sessions.lock().unwrap().get(&tunnel_id).cloned()
    }

    /// Installs a session, evicting any prior one for the same `tunnel_id`
    /// (spec.md §9: the most recent control channel "wins").
    /// Returns the evicted session, if any, so the caller can tear it down.
    pub fn install(&self, tunnel_id: i64, session: TunnelSession) -> Option<TunnelSession> {
        self.sessions.lock().unwrap().insert(tunnel_id, session)
    }

    /// Removes the session iff it's still owned by `control_channel_id` —
    /// guards against a disconnecting old channel clobbering a session a
    /// newer `tunnel_auth` just installed for the same `tunnel_id`.
    pub fn remove_if_owned_by(&self, tunnel_id: i64, control_channel_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions
            .get(&tunnel_id)
            .map(|s| s.control_channel_id == control_channel_id)
            .unwrap_or(false)
        {
            sessions.remove(&tunnel_id);
            true
        } else {
            false
        }
    }

    pub fn tunnel_id_for_channel(&self, control_channel_id: &str) -> Option<i64> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|(_, s)| s.control_channel_id == control_channel_id)
            .map(|(id, _)| *id)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<TunnelSessions>,
    pub directory: Arc<dyn TunnelDirectory>,
    pub controller: Arc<TunnelController>,
}

impl AppState {
    pub fn new(config: Config, directory: Arc<dyn TunnelDirectory>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(TunnelSessions::default());
        let controller = Arc::new(TunnelController::new(
            config.clone(),
            registry.clone(),
            sessions.clone(),
        ));
        Self {
            config,
            registry,
            sessions,
            directory,
            controller,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session(control_channel_id: &str) -> TunnelSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        TunnelSession {
            control_channel_id: control_channel_id.to_string(),
            tx,
            local_port: 3000,
            public_port: 10001,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn install_evicts_the_prior_session_for_the_same_tunnel_id() {
        let sessions = TunnelSessions::default();
        assert!(sessions.install(1, sample_session("chan-a")).is_none());

        // spec.md §8 invariant 2: at most one live session per tunnel_id,
        // so a second install for the same id must evict the first rather
        // than coexist with it.
        let evicted = sessions.install(1, sample_session("chan-b"));
        assert_eq!(evicted.unwrap().control_channel_id, "chan-a");
        assert_eq!(sessions.get(1).unwrap().control_channel_id, "chan-b");
    }

    #[test]
    fn remove_if_owned_by_only_removes_a_session_its_own_channel_installed() {
        let sessions = TunnelSessions::default();
        sessions.install(1, sample_session("chan-a"));
        sessions.install(1, sample_session("chan-b")); // evicts chan-a

        // chan-a disconnecting after being evicted must not clobber the
        // session chan-b just installed for the same tunnel_id.
        assert!(!sessions.remove_if_owned_by(1, "chan-a"));
        assert!(sessions.get(1).is_some());

        assert!(sessions.remove_if_owned_by(1, "chan-b"));
        assert!(sessions.get(1).is_none());
    }

    #[test]
    fn tunnel_id_for_channel_finds_the_owning_tunnel() {
        let sessions = TunnelSessions::default();
        sessions.install(7, sample_session("chan-x"));
        assert_eq!(sessions.tunnel_id_for_channel("chan-x"), Some(7));
        assert_eq!(sessions.tunnel_id_for_channel("chan-nonexistent"), None);
    }
}
