//! # Tunnel Controller (spec.md §4.1)
//!
//! Owns the lifecycle of Listener Workers: starts them on successful
//! authentication, stops them on disconnect or administrative deletion, and
//! guarantees single ownership of each public port.
//!
//! Grounded on `original_source/proxy_server.py`'s `TrafficProxy` class —
//! its `active_ports`/`stop_flags`/`proxy_threads` dicts map directly onto
//! this module's `ports` map and `ListenerHandle`'s stop flag and task
//! handles.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Socket, Type};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tunnel_protocol::Protocol;

use crate::config::Config;
use crate::error::TunnelError;
use crate::registry::Registry;
use crate::state::TunnelSessions;
use crate::{tcp_listener, udp_listener};

/// A stop flag plus the worker task(s) owning a public port, shared between
/// the Controller (which flips the flag and closes the listening socket)
/// and the worker loops (which poll it every `listener_poll_interval`).
pub struct ListenerHandle {
    pub tunnel_id: i64,
    pub stop: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Sets the stop flag and aborts the worker tasks. Listener workers also
    /// observe the flag cooperatively on their own poll interval; aborting
    /// here makes `stop_listener` return promptly even if a worker is
    /// blocked in a syscall the flag alone wouldn't unblock in time.
    fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct TunnelController {
    config: Arc<Config>,
    registry: Arc<Registry>,
    sessions: Arc<TunnelSessions>,
    ports: Mutex<HashMap<u16, ListenerHandle>>,
}

impl TunnelController {
    pub fn new(config: Arc<Config>, registry: Arc<Registry>, sessions: Arc<TunnelSessions>) -> Self {
        Self {
            config,
            registry,
            sessions,
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent per `public_port`. Fails with `PortOutOfRange` if
    /// `public_port` falls outside `config.public_port_range()` (spec.md §6:
    /// the range "used externally when minting tunnels" — the Controller
    /// sanity-checks it here too, since a stale or hand-edited directory
    /// record could still carry an out-of-range port). Fails with
    /// `PortInUse` if another tunnel already owns the port. On
    /// `Protocol::Both`, starts one TCP and one UDP worker sharing the port
    /// number (different socket families).
    pub async fn start_listener(
        &self,
        tunnel_id: i64,
        public_port: u16,
        protocol: Protocol,
    ) -> Result<(), TunnelError> {
        let range = self.config.public_port_range();
        if !range.contains(&public_port) {
            return Err(TunnelError::PortOutOfRange {
                port: public_port,
                range_start: *range.start(),
                range_end: *range.end(),
            });
        }

        {
            let ports = self.ports.lock().unwrap();
            if let Some(existing) = ports.get(&public_port) {
                if existing.tunnel_id == tunnel_id {
                    return Ok(()); // already running for this tunnel: idempotent
                }
                return Err(TunnelError::PortInUse(public_port));
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut tasks = Vec::new();

        if protocol.wants_tcp() {
            let listener = bind_tcp_listener(
                &self.config.bind_host,
                public_port,
                self.config.accept_backlog,
            )
            .map_err(|source| TunnelError::ListenerBindFailure {
                port: public_port,
                source,
            })?;
            let registry = self.registry.clone();
            let sessions = self.sessions.clone();
            let config = self.config.clone();
            let stop_tcp = stop.clone();
            tasks.push(tokio::spawn(async move {
                tcp_listener::run(listener, tunnel_id, registry, sessions, config, stop_tcp).await;
            }));
        }

        if protocol.wants_udp() {
            let socket = bind_udp_socket(&self.config.bind_host, public_port)
                .map_err(|source| TunnelError::ListenerBindFailure {
                    port: public_port,
                    source,
                })?;
            let registry = self.registry.clone();
            let sessions = self.sessions.clone();
            let config = self.config.clone();
            let stop_udp = stop.clone();
            tasks.push(tokio::spawn(async move {
                udp_listener::run(socket, tunnel_id, registry, sessions, config, stop_udp).await;
            }));
        }

        info!(tunnel_id, public_port, %protocol, "listener started");
        self.ports.lock().unwrap().insert(
            public_port,
            ListenerHandle {
                tunnel_id,
                stop,
                tasks,
            },
        );
        Ok(())
    }

    /// Best-effort-synchronous: after return, no new connections for this
    /// tunnel will be accepted, and all pre-existing connections are in the
    /// process of tearing down.
    pub fn stop_listener(&self, tunnel_id: i64, public_port: u16) {
        let handle = {
            let mut ports = self.ports.lock().unwrap();
            match ports.get(&public_port) {
                Some(h) if h.tunnel_id == tunnel_id => ports.remove(&public_port),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            warn!(tunnel_id, public_port, "stop_listener called for unowned port");
            return;
        };
        handle.stop();
        let removed = self.registry.remove_where_tunnel(tunnel_id);
        info!(tunnel_id, public_port, removed, "listener stopped");
    }

    /// Stops whichever port(s) `tunnel_id` owns, looking them up by scanning
    /// — used on `ControlChannelLost`, where the caller only has the
    /// `tunnel_id`, not the port.
    pub fn stop_all_for_tunnel(&self, tunnel_id: i64) {
        let ports: Vec<u16> = {
            let ports = self.ports.lock().unwrap();
            ports
                .iter()
                .filter(|(_, h)| h.tunnel_id == tunnel_id)
                .map(|(port, _)| *port)
                .collect()
        };
        for port in ports {
            self.stop_listener(tunnel_id, port);
        }
    }

    pub fn owner_of(&self, public_port: u16) -> Option<i64> {
        self.ports
            .lock()
            .unwrap()
            .get(&public_port)
            .map(|h| h.tunnel_id)
    }
}

/// Binds a public TCP listener with `SO_REUSEADDR` set and an explicit
/// `listen()` backlog (spec.md §6: "`SO_REUSEADDR` is set so restarts do not
/// need to wait out TIME_WAIT"; §4.2: "listens with a backlog of at least
/// 50"). `tokio::net::TcpListener::bind` alone doesn't expose the backlog
/// parameter, so the socket is built and configured with `socket2` first and
/// handed to tokio afterward, the way the retrieved tunnel-proxy corpus does
/// it.
fn bind_tcp_listener(host: &str, port: u16, backlog: u32) -> std::io::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    tokio::net::TcpListener::from_std(socket.into())
}

/// Binds a public UDP socket with `SO_REUSEADDR` set, the same way.
fn bind_udp_socket(host: &str, port: u16) -> std::io::Result<tokio::net::UdpSocket> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    tokio::net::UdpSocket::from_std(socket.into())
}
