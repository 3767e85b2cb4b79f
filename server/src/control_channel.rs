//! # Control Channel Adapter (spec.md §4.6)
//!
//! Event-oriented bidirectional messaging over a WebSocket, one task pair
//! per connected client. Preserves per-channel FIFO: a single outbound task
//! drains an mpsc queue in arrival order, and the inbound loop dispatches
//! one message at a time before reading the next.
//!
//! Grounded almost verbatim on `server/src/handlers.rs::handle_connection` —
//! the split sink/stream, the `Arc<Mutex<sink>>` outbound task, the
//! `mpsc::unbounded_channel` queue, and the cleanup-on-disconnect block are
//! all carried over; only the message dispatch is rewritten for spec.md's
//! authenticate → listener-owning model instead of the teacher's
//! agent/controller relay roles.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use tunnel_protocol::{decode_payload, ControlMessage};
use uuid::Uuid;

use crate::authenticator;
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let channel_id = Uuid::new_v4().to_string();
    info!(channel_id, "control channel opened");

    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    let ws_sink = Arc::new(AsyncMutex::new(ws_sink));
    let outbound_sink = ws_sink.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "failed to serialize control message");
                    continue;
                }
            };
            let mut sink = outbound_sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // The tunnel_id this channel authenticated as, if any. A channel is
    // either never authenticated, authenticated once, or re-authenticates
    // (evicting its own prior session, a no-op in practice).
    let mut owned_tunnel_id: Option<i64> = None;

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<ControlMessage>(&text) else {
                    continue;
                };
                if let Some(tid) = dispatch(&state, &channel_id, &tx, parsed).await {
                    owned_tunnel_id = Some(tid);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    info!(channel_id, "control channel closed");
    outbound_task.abort();

    teardown(&state, &channel_id, owned_tunnel_id).await;
}

/// ControlChannelLost (spec.md §7): tear down every Tunnel Session associated
/// with this channel, stop its listeners, close all matching Registry
/// entries, mark the tunnel inactive. A no-op if `channel_id` no longer owns
/// any session — either it never authenticated, or a newer control channel
/// already evicted it (spec.md §9).
async fn teardown(state: &AppState, channel_id: &str, owned_tunnel_id: Option<i64>) {
    if let Some(tunnel_id) = owned_tunnel_id.or_else(|| state.sessions.tunnel_id_for_channel(channel_id)) {
        if state.sessions.remove_if_owned_by(tunnel_id, channel_id) {
            state.controller.stop_all_for_tunnel(tunnel_id);
            state.directory.mark_inactive(tunnel_id);
            warn!(tunnel_id, channel_id, "tunnel session torn down on disconnect");
        }
    }
}

/// Handles one inbound message. Returns `Some(tunnel_id)` when this message
/// caused `channel_id` to own a Tunnel Session, so the caller can remember
/// it for disconnect cleanup.
async fn dispatch(
    state: &AppState,
    channel_id: &str,
    tx: &crate::state::ControlTx,
    msg: ControlMessage,
) -> Option<i64> {
    match msg {
        ControlMessage::TunnelAuth {
            token,
            tunnel_id,
            local_port,
        } => {
            let outcome =
                authenticator::authenticate(state, channel_id, tx.clone(), token, tunnel_id, local_port)
                    .await;

            if let Some(evicted) = outcome.evicted {
                // A prior control channel owned this tunnel (spec.md §9:
                // the most recent control channel wins). Its listeners stay
                // up under the new channel; when the old channel eventually
                // disconnects, `remove_if_owned_by` will find it no longer
                // owns the session and skip tearing anything down.
                warn!(
                    old_channel = evicted.control_channel_id,
                    new_channel = channel_id,
                    "tunnel session evicted by a newer control channel"
                );
            }

            let authenticated = matches!(outcome.response, ControlMessage::AuthResponse { success: true, .. });
            let _ = tx.send(outcome.response);
            if authenticated {
                Some(tunnel_id)
            } else {
                None
            }
        }

        ControlMessage::StreamResponse { conn_id, data } => {
            handle_stream_response(state, &conn_id, &data).await;
            None
        }

        ControlMessage::CloseConnection { conn_id } => {
            // Idempotent: if the entry is already gone, `remove` is a no-op.
            state.registry.mark_inactive(&conn_id);
            state.registry.remove(&conn_id);
            None
        }

        ControlMessage::UdpResponse { session_id, data } => {
            handle_udp_response(state, &session_id, &data).await;
            None
        }

        // S→C-only variants arriving from a client are protocol violations;
        // ignore rather than tear down the channel over a malformed peer.
        ControlMessage::AuthResponse { .. }
        | ControlMessage::NewConnection { .. }
        | ControlMessage::StreamData { .. }
        | ControlMessage::UdpPacket { .. } => None,
    }
}

/// Write path for a TCP connection (spec.md §4.3): decode the base64
/// payload and write it to the owned socket. Looks up the write half and
/// drops the registry lock *before* performing the write, per spec.md §5's
/// deadlock-avoidance rule.
async fn handle_stream_response(state: &AppState, conn_id: &str, data: &str) {
    let Some((write_half, active)) = state.registry.tcp_write_half(conn_id) else {
        return;
    };
    if !active {
        return;
    }
    let Ok(bytes) = decode_payload(data) else {
        warn!(conn_id, "invalid base64 in stream_response");
        return;
    };

    use tokio::io::AsyncWriteExt;
    let mut socket = write_half.lock().await;
    if socket.write_all(&bytes).await.is_err() {
        drop(socket);
        state.registry.mark_inactive(conn_id);
    }
}

/// Response path for UDP (spec.md §4.4): `sendto(peer_addr)`, no delivery
/// guarantee.
async fn handle_udp_response(state: &AppState, session_id: &str, data: &str) {
    let Some((socket, peer_addr)) = state.registry.udp_target(session_id) else {
        return;
    };
    let Ok(bytes) = decode_payload(data) else {
        warn!(session_id, "invalid base64 in udp_response");
        return;
    };
    let _ = socket.send_to(&bytes, peer_addr).await;
}
