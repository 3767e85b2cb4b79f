//! Integration test driving the whole data plane: a fake control channel
//! (a real WebSocket client, since the Control Channel Adapter's contract is
//! the wire protocol) authenticates a tunnel, a public TCP peer connects,
//! and bytes flow both ways. Grounded in the scenario list of spec.md §8.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use tunnel_protocol::{decode_payload, encode_payload, ControlMessage, Protocol};
use tunnel_server::config::Config;
use tunnel_server::directory::{InMemoryDirectory, TunnelRecord, TunnelStatus};
use tunnel_server::state::AppState;

fn test_config() -> Config {
    Config {
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
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_server(directory: InMemoryDirectory) -> (String, u16) {
    let state = AppState::new(test_config(), Arc::new(directory));
    let app = tunnel_server::app(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let control_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://127.0.0.1:{control_port}/ws"), control_port)
}

#[tokio::test]
async fn full_tcp_round_trip_through_an_authenticated_tunnel() {
    let public_port = free_port().await;
    let directory = InMemoryDirectory::new();
    directory.insert(TunnelRecord {
        id: 1,
        token: "tok".into(),
        local_port: 3000,
        public_port,
        protocol: Protocol::Tcp,
        verified: true,
        verification_code: "code".into(),
        status: TunnelStatus::Inactive,
        last_connected: None,
    });
    let (ws_url, _control_port) = spawn_server(directory).await;

    let (ws_stream, _) = connect_async(&ws_url).await.unwrap();
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let auth = serde_json::to_string(&ControlMessage::TunnelAuth {
        token: "tok".into(),
        tunnel_id: 1,
        local_port: 3000,
    })
    .unwrap();
    ws_sink.send(Message::Text(auth.into())).await.unwrap();

    let reply = next_control_message(&mut ws_stream).await;
    match reply {
        ControlMessage::AuthResponse {
            success,
            public_port: pp,
            ..
        } => {
            assert!(success);
            assert_eq!(pp, Some(public_port));
        }
        other => panic!("expected AuthResponse, got {other:?}"),
    }

    // A public peer connects to the tunnel's public port.
    let mut peer = tokio::net::TcpStream::connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    peer.write_all(b"hello service").await.unwrap();

    let conn_id = match next_control_message(&mut ws_stream).await {
        ControlMessage::NewConnection { conn_id, .. } => conn_id,
        other => panic!("expected NewConnection, got {other:?}"),
    };

    let data = match next_control_message(&mut ws_stream).await {
        ControlMessage::StreamData { conn_id: c, data, .. } => {
            assert_eq!(c, conn_id);
            data
        }
        other => panic!("expected StreamData, got {other:?}"),
    };
    assert_eq!(decode_payload(&data).unwrap(), b"hello service");

    // The client relays a response back over the control channel.
    let response = serde_json::to_string(&ControlMessage::StreamResponse {
        conn_id: conn_id.clone(),
        data: encode_payload(b"hello peer"),
    })
    .unwrap();
    ws_sink.send(Message::Text(response.into())).await.unwrap();

    let mut buf = [0u8; 64];
    let n = peer.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello peer");
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let directory = InMemoryDirectory::new();
    directory.insert(TunnelRecord {
        id: 1,
        token: "right".into(),
        local_port: 3000,
        public_port: free_port().await,
        protocol: Protocol::Tcp,
        verified: true,
        verification_code: "code".into(),
        status: TunnelStatus::Inactive,
        last_connected: None,
    });
    let (ws_url, _) = spawn_server(directory).await;

    let (ws_stream, _) = connect_async(&ws_url).await.unwrap();
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let auth = serde_json::to_string(&ControlMessage::TunnelAuth {
        token: "wrong".into(),
        tunnel_id: 1,
        local_port: 3000,
    })
    .unwrap();
    ws_sink.send(Message::Text(auth.into())).await.unwrap();

    match next_control_message(&mut ws_stream).await {
        ControlMessage::AuthResponse { success, error, .. } => {
            assert!(!success);
            assert!(error.is_some());
        }
        other => panic!("expected AuthResponse, got {other:?}"),
    }
}

async fn next_control_message(
    stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> ControlMessage {
    loop {
        match stream.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}
