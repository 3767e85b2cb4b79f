//! # Control Channel Reconnect Loop
//!
//! Connects outbound to the tunnel server's `/ws` endpoint, sends
//! `tunnel_auth`, and dispatches every message the server sends afterward.
//! Reconnects on any disconnect, with all per-connection state cleared
//! first — the control channel is the only thing this client maintains
//! state across; it holds no durable identity of its own.
//!
//! Grounded on `client/src-tauri/src/agent.rs::run_agent_loop`'s outer
//! reconnect loop, outbound-sender task, and inbound dispatch match — the
//! heartbeat sub-task is dropped (spec.md's wire protocol has no
//! ping/pong messages) and the controller/agent role split collapses into
//! a single "relay one local service" role.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use tunnel_protocol::ControlMessage;

use crate::config::ClientConfig;
use crate::relay;
use crate::state::ClientState;

const RECONNECT_DELAY_SECS: u64 = 3;

/// Runs the client's control-channel loop forever: connect, authenticate,
/// relay, and on disconnect wait `RECONNECT_DELAY_SECS` before trying
/// again.
pub async fn run_client_loop(config: Arc<ClientConfig>, state: Arc<ClientState>) {
    loop {
        info!(server_url = %config.server_url, "connecting to tunnel server");

        match connect_async(&config.server_url).await {
            Ok((ws_stream, _)) => {
                info!("connected");
                let (ws_sink, mut ws_stream_rx) = ws_stream.split();
                let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));

                let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
                *state.control_tx.write().await = Some(tx.clone());

                let _ = tx.send(ControlMessage::TunnelAuth {
                    token: config.token.clone(),
                    tunnel_id: config.tunnel_id,
                    local_port: config.local_port,
                });

                let outbound_sink = ws_sink.clone();
                let outbound = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        let Ok(text) = serde_json::to_string(&msg) else {
                            continue;
                        };
                        let mut sink = outbound_sink.lock().await;
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                while let Some(Ok(msg)) = ws_stream_rx.next().await {
                    match msg {
                        Message::Text(text) => {
                            let Ok(parsed) = serde_json::from_str::<ControlMessage>(&text) else {
                                continue;
                            };
                            handle_server_message(&config, &state, &tx, parsed).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                outbound.abort();
                *state.control_tx.write().await = None;
                state.clear_all().await;
                warn!("disconnected from tunnel server");
            }
            Err(e) => {
                error!(error = %e, "connection failed");
            }
        }

        info!(seconds = RECONNECT_DELAY_SECS, "reconnecting");
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

/// Dispatches one message received on the control channel.
async fn handle_server_message(
    config: &Arc<ClientConfig>,
    state: &Arc<ClientState>,
    tx: &mpsc::UnboundedSender<ControlMessage>,
    msg: ControlMessage,
) {
    match msg {
        ControlMessage::AuthResponse {
            success,
            public_port,
            protocol,
            message,
            error,
            verification_url,
        } => {
            if success {
                info!(
                    public_port = public_port.unwrap_or_default(),
                    protocol = ?protocol,
                    message = message.as_deref().unwrap_or_default(),
                    "tunnel authenticated"
                );
            } else {
                error!(
                    error = error.as_deref().unwrap_or("unknown"),
                    verification_url = verification_url.as_deref().unwrap_or_default(),
                    "tunnel authentication failed"
                );
            }
        }

        ControlMessage::NewConnection { conn_id, .. } => {
            let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            state
                .data_channels
                .write()
                .await
                .insert(conn_id.clone(), data_tx);

            let config = config.clone();
            let state_clone = state.clone();
            let tx_clone = tx.clone();
            let handle_conn_id = conn_id.clone();
            let handle = tokio::spawn(async move {
                relay::handle_tcp_relay(
                    conn_id,
                    config.local_host.clone(),
                    config.local_port,
                    tx_clone,
                    state_clone,
                    data_rx,
                )
                .await;
            });
            state
                .task_handles
                .write()
                .await
                .insert(handle_conn_id, handle);
        }

        ControlMessage::StreamData { conn_id, data, .. } => {
            let Some(bytes) = relay::decode_or_log(&conn_id, &data) else {
                return;
            };
            let channels = state.data_channels.read().await;
            if let Some(sender) = channels.get(&conn_id) {
                let _ = sender.send(bytes);
            }
        }

        ControlMessage::CloseConnection { conn_id } => {
            state.remove_connection(&conn_id).await;
        }

        ControlMessage::UdpPacket {
            session_id,
            data,
            addr,
            ..
        } => {
            let Some(bytes) = relay::decode_or_log(&session_id, &data) else {
                return;
            };

            let existing = state.data_channels.read().await.get(&session_id).cloned();
            match existing {
                Some(sender) => {
                    let _ = sender.send(bytes);
                }
                None => {
                    info!(session_id, addr, "new udp session");
                    let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                    let _ = data_tx.send(bytes);
                    state
                        .data_channels
                        .write()
                        .await
                        .insert(session_id.clone(), data_tx);

                    let config = config.clone();
                    let state_clone = state.clone();
                    let tx_clone = tx.clone();
                    let handle_session_id = session_id.clone();
                    let handle = tokio::spawn(async move {
                        relay::handle_udp_relay(
                            session_id,
                            config.local_host.clone(),
                            config.local_port,
                            tx_clone,
                            state_clone,
                            data_rx,
                        )
                        .await;
                    });
                    state
                        .task_handles
                        .write()
                        .await
                        .insert(handle_session_id, handle);
                }
            }
        }

        // C→S-only variants arriving on the read side are protocol
        // violations from a misbehaving server; ignore.
        ControlMessage::TunnelAuth { .. }
        | ControlMessage::StreamResponse { .. }
        | ControlMessage::UdpResponse { .. } => {}
    }
}
