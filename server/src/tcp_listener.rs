//! # TCP Listener Worker + TCP Stream Handler (spec.md §4.2/§4.3)
//!
//! One worker per active tunnel with TCP enabled. Binds the tunnel's public
//! port, accepts with a short poll timeout so the stop flag is checked
//! regularly (`original_source/proxy_server.py::_tcp_proxy_worker`'s
//! `settimeout(1.0)` loop), and hands each accepted connection to a Stream
//! Handler that reads in 8192-byte chunks and emits `stream_data` frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tunnel_protocol::{encode_payload, ControlMessage, Protocol};
use uuid::Uuid;

use crate::config::Config;
use crate::registry::{ConnectionEntry, Registry};
use crate::state::TunnelSessions;

/// Runs the accept loop for one tunnel's public TCP port until the stop
/// flag is set or the listening socket is closed out from under it.
pub async fn run(
    listener: TcpListener,
    tunnel_id: i64,
    registry: Arc<Registry>,
    sessions: Arc<TunnelSessions>,
    config: Arc<Config>,
    stop: Arc<AtomicBool>,
) {
    let poll_interval = config.listener_poll_interval();
    info!(tunnel_id, "tcp listener accept loop starting");

    while !stop.load(Ordering::SeqCst) {
        match timeout(poll_interval, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                let conn_id = Uuid::new_v4().to_string();
                info!(tunnel_id, conn_id, %peer, "accepted tcp connection");

                let Some(session) = sessions.get(tunnel_id) else {
                    // Tunnel Session vanished between accept and dispatch:
                    // tell the peer and close (spec.md §4.2).
                    let mut stream = stream;
                    let _ = stream
                        .write_all(b"HTTP/1.1 503 Service Unavailable\r\n\r\nTunnel not connected")
                        .await;
                    continue;
                };

                let (read_half, write_half) = stream.into_split();
                registry.insert_tcp(
                    conn_id.clone(),
                    ConnectionEntry {
                        tunnel_id,
                        write_half: Arc::new(AsyncMutex::new(write_half)),
                        active: true,
                    },
                );

                if session
                    .tx
                    .send(ControlMessage::NewConnection {
                        conn_id: conn_id.clone(),
                        tunnel_id,
                        protocol: Protocol::Tcp,
                    })
                    .is_err()
                {
                    // Control channel already gone; the entry will be
                    // reaped by the disconnect handler's teardown sweep.
                    continue;
                }

                let registry = registry.clone();
                let config = config.clone();
                tokio::spawn(stream_read_loop(conn_id, read_half, session.tx, registry, config));
            }
            Ok(Err(e)) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(tunnel_id, error = %e, "transient accept error");
                }
            }
            Err(_timeout) => continue,
        }
    }

    info!(tunnel_id, "tcp listener accept loop stopped");
}

/// The TCP Stream Handler's read side. The write side (driven by inbound
/// `stream_response` frames) is in `control_channel::handle_stream_response`,
/// since it's invoked from the control channel's dispatch loop rather than
/// owning its own task.
async fn stream_read_loop(
    conn_id: String,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    tx: crate::state::ControlTx,
    registry: Arc<Registry>,
    config: Arc<Config>,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; config.tcp_read_chunk];
    let read_timeout = config.tcp_read_timeout();

    loop {
        if !registry.is_active(&conn_id) {
            break;
        }
        match timeout(read_timeout, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => break, // peer EOF
            Ok(Ok(n)) => {
                let data = encode_payload(&buf[..n]);
                if tx
                    .send(ControlMessage::StreamData {
                        conn_id: conn_id.clone(),
                        data,
                        protocol: Protocol::Tcp,
                    })
                    .is_err()
                {
                    break; // control channel gone
                }
            }
            Ok(Err(e)) => {
                error!(conn_id, error = %e, "tcp read error");
                break;
            }
            Err(_elapsed) => continue, // read timeout is not fatal
        }
    }

    registry.mark_inactive(&conn_id);
    let _ = tx.send(ControlMessage::CloseConnection {
        conn_id: conn_id.clone(),
    });
    registry.remove(&conn_id);
    info!(conn_id, "tcp stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TunnelSession;
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncWriteExt as _;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            control_host: "127.0.0.1".into(),
            control_port: 0,
            bind_host: "127.0.0.1".into(),
            accept_backlog: 50,
            tcp_read_chunk: 8192,
            udp_read_chunk: 65535,
            tcp_read_timeout_secs: 300,
            udp_session_idle_timeout_secs: 120,
            listener_poll_interval_secs: 1,
            public_port_min: 1,
            public_port_max: 65535,
        })
    }

    #[tokio::test]
    async fn accepted_connection_without_session_gets_503() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(TunnelSessions::default());
        let config = test_config();
        let stop = Arc::new(AtomicBool::new(false));

        let stop_clone = stop.clone();
        let server = tokio::spawn(run(listener, 1, registry, sessions, config, stop_clone));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        use tokio::io::AsyncReadExt;
        let n = client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("503"));

        stop.store(true, Ordering::SeqCst);
        server.abort();
    }

    #[tokio::test]
    async fn stream_emits_new_connection_then_stream_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(TunnelSessions::default());
        let config = test_config();
        let stop = Arc::new(AtomicBool::new(false));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        sessions.install(
            1,
            TunnelSession {
                control_channel_id: "chan-1".into(),
                tx,
                local_port: 3000,
                public_port: addr.port(),
                protocol: Protocol::Tcp,
            },
        );

        let server = tokio::spawn(run(listener, 1, registry, sessions, config, stop.clone()));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping\n").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ControlMessage::NewConnection { .. }));

        let second = rx.recv().await.unwrap();
        match second {
            ControlMessage::StreamData { data, .. } => {
                let decoded = tunnel_protocol::decode_payload(&data).unwrap();
                assert_eq!(decoded, b"ping\n");
            }
            other => panic!("expected StreamData, got {other:?}"),
        }

        stop.store(true, Ordering::SeqCst);
        server.abort();
    }
}
