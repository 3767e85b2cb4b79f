//! # Client State
//!
//! Holds everything the reconnect loop and the per-connection relay tasks
//! share: the outbound control channel sender, the per-`conn_id`/`session_id`
//! data channels that feed bytes from the server into a local socket, and
//! the spawned task handles so a disconnect can clean up after itself.
//!
//! Grounded on `client/src-tauri/src/state.rs::AgentState`, stripped of
//! every Tauri-UI-facing field (`agent_id`, `tunnels`, `pending_connects`,
//! the whole controller/agent role split) that has no counterpart in a
//! single-purpose remote client relaying one local service.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use tunnel_protocol::ControlMessage;

pub struct ClientState {
    /// Channel to send outbound control messages to the server. `None`
    /// while disconnected.
    pub control_tx: RwLock<Option<mpsc::UnboundedSender<ControlMessage>>>,

    /// Per-connection data channels for the local-socket ↔ control-channel
    /// relay. Keyed by `conn_id` for TCP, `session_id` for UDP.
    pub data_channels: RwLock<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,

    /// Spawned relay task handles, keyed the same way as `data_channels`,
    /// aborted on `close_connection`/`udp_response`-implied teardown or on
    /// disconnect.
    pub task_handles: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            control_tx: RwLock::new(None),
            data_channels: RwLock::new(HashMap::new()),
            task_handles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn remove_connection(&self, key: &str) {
        self.data_channels.write().await.remove(key);
        if let Some(handle) = self.task_handles.write().await.remove(key) {
            handle.abort();
        }
    }

    /// Aborts every relay task and clears all per-connection state. Called
    /// on disconnect so a reconnect starts from a clean slate.
    pub async fn clear_all(&self) {
        self.data_channels.write().await.clear();
        let mut handles = self.task_handles.write().await;
        for (key, handle) in handles.drain() {
            handle.abort();
            info!(key, "aborted relay task on disconnect");
        }
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
