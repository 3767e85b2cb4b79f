//! # Local-Socket ↔ Control-Channel Relay
//!
//! Each `new_connection` (TCP) or first `udp_packet` (UDP) the server sends
//! spawns one of these tasks: it owns a socket to the locally-tunneled
//! service, and relays bytes between that socket and the control channel by
//! base64-framed `stream_data`/`stream_response` (TCP) or
//! `udp_packet`/`udp_response` (UDP) messages.
//!
//! Grounded on `client/src-tauri/src/relay.rs::handle_stream_relay`'s
//! split-task shape (local-read → encode → send; data channel recv →
//! write), generalized from the teacher's peer-to-peer tunnel streams to
//! spec.md's client-forwards-to-one-local-service model.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tunnel_protocol::{decode_payload, encode_payload, ControlMessage, TCP_READ_CHUNK};

use crate::state::ClientState;

/// Relays one TCP connection: opens `local_port`, then runs two concurrent
/// halves until either the local socket or the data channel closes.
pub async fn handle_tcp_relay(
    conn_id: String,
    local_host: String,
    local_port: u16,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    state: Arc<ClientState>,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let addr = format!("{local_host}:{local_port}");
    let stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(conn_id, %addr, error = %e, "local connect failed");
            state.remove_connection(&conn_id).await;
            let _ = control_tx.send(ControlMessage::CloseConnection { conn_id });
            return;
        }
    };

    let (mut read_half, mut write_half) = stream.into_split();

    let forward_conn_id = conn_id.clone();
    let forward_tx = control_tx.clone();
    let local_to_server = tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = encode_payload(&buf[..n]);
                    if forward_tx
                        .send(ControlMessage::StreamResponse {
                            conn_id: forward_conn_id.clone(),
                            data,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let server_to_local = tokio::spawn(async move {
        while let Some(bytes) = data_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = local_to_server => {},
        _ = server_to_local => {},
    }

    state.remove_connection(&conn_id).await;
    let _ = control_tx.send(ControlMessage::CloseConnection { conn_id });
}

/// Relays one UDP session: a single local `UdpSocket` connected to
/// `local_port`, fed by the server's `udp_packet` messages and echoing its
/// replies back as `udp_response`.
pub async fn handle_udp_relay(
    session_id: String,
    local_host: String,
    local_port: u16,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    state: Arc<ClientState>,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let addr = format!("{local_host}:{local_port}");
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(session_id, error = %e, "local udp bind failed");
            state.remove_connection(&session_id).await;
            return;
        }
    };
    if let Err(e) = socket.connect(&addr).await {
        tracing::error!(session_id, %addr, error = %e, "local udp connect failed");
        state.remove_connection(&session_id).await;
        return;
    }
    let socket = Arc::new(socket);

    let recv_socket = socket.clone();
    let recv_session_id = session_id.clone();
    let recv_tx = control_tx.clone();
    let local_to_server = tokio::spawn(async move {
        let mut buf = vec![0u8; tunnel_protocol::UDP_READ_CHUNK];
        loop {
            match recv_socket.recv(&mut buf).await {
                Ok(n) => {
                    let data = encode_payload(&buf[..n]);
                    if recv_tx
                        .send(ControlMessage::UdpResponse {
                            session_id: recv_session_id.clone(),
                            data,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let forward_to_local = tokio::spawn(async move {
        while let Some(bytes) = data_rx.recv().await {
            let _ = socket.send(&bytes).await;
        }
    });

    tokio::select! {
        _ = local_to_server => {},
        _ = forward_to_local => {},
    }

    state.remove_connection(&session_id).await;
}

/// Decodes a base64 `stream_data`/`udp_packet` payload, logging and
/// discarding malformed frames rather than tearing down the connection.
pub fn decode_or_log(key: &str, data: &str) -> Option<Vec<u8>> {
    match decode_payload(data) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(key, error = %e, "invalid base64 payload from server");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// spec.md §8 scenario 2 (one half of it): bytes the server forwards
    /// into `data_rx` reach the local socket, and bytes the local service
    /// writes back come out the other end as base64-framed
    /// `stream_response` messages tagged with the same `conn_id`.
    #[tokio::test]
    async fn handle_tcp_relay_forwards_both_directions_until_local_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();

        let local_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"hello from server");
            socket.write_all(b"hello from local service").await.unwrap();
            // Dropping `socket` here closes the write half, which is what
            // unblocks `handle_tcp_relay`'s `local_to_server` read loop.
        });

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ClientState::new());

        data_tx.send(b"hello from server".to_vec()).unwrap();

        handle_tcp_relay(
            "conn-1".to_string(),
            "127.0.0.1".to_string(),
            local_port,
            control_tx,
            state,
            data_rx,
        )
        .await;

        local_task.await.unwrap();

        let mut forwarded = Vec::new();
        while let Ok(msg) = control_rx.try_recv() {
            match msg {
                ControlMessage::StreamResponse { conn_id, data } => {
                    assert_eq!(conn_id, "conn-1");
                    forwarded.extend(decode_payload(&data).unwrap());
                }
                ControlMessage::CloseConnection { conn_id } => {
                    assert_eq!(conn_id, "conn-1");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(forwarded, b"hello from local service");
    }

    /// A local connect failure sends `close_connection` immediately and
    /// never touches `data_rx`.
    #[tokio::test]
    async fn handle_tcp_relay_closes_the_connection_when_local_connect_fails() {
        // Port 0 on an already-bound listener isn't available to connect to
        // directly, so bind-then-drop to get a port nothing is listening on.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (_data_tx, data_rx) = mpsc::unbounded_channel();
        let state = Arc::new(ClientState::new());

        handle_tcp_relay(
            "conn-2".to_string(),
            "127.0.0.1".to_string(),
            dead_port,
            control_tx,
            state,
            data_rx,
        )
        .await;

        match control_rx.try_recv().unwrap() {
            ControlMessage::CloseConnection { conn_id } => assert_eq!(conn_id, "conn-2"),
            other => panic!("expected CloseConnection, got {other:?}"),
        }
        assert!(control_rx.try_recv().is_err());
    }
}
