//! # Authenticator (spec.md §4.7)
//!
//! Validates `{tunnel_id, token}` against the Tunnel Directory, checks
//! `verified`, and on success installs a Tunnel Session, flips
//! `status=active`, records `last_connected`, starts the listener, and
//! returns the `auth_response` to send back.
//!
//! Field shapes (`success`, `public_port`, `protocol`, `message`, `error`,
//! `verification_url`) are grounded on `original_source/app.py`'s
//! `handle_tunnel_auth`.

use tracing::{info, warn};
use tunnel_protocol::ControlMessage;

use crate::directory::{now_unix, TunnelDirectory};
use crate::error::TunnelError;
use crate::state::{AppState, TunnelSession};

/// Outcome of a `tunnel_auth` attempt: the response to send back to the
/// client, and — on success — the session that was just evicted, if any,
/// so its old control channel can be torn down by the caller.
pub struct AuthOutcome {
    pub response: ControlMessage,
    pub evicted: Option<TunnelSession>,
}

pub async fn authenticate(
    state: &AppState,
    control_channel_id: &str,
    tx: crate::state::ControlTx,
    token: String,
    tunnel_id: i64,
    local_port: u16,
) -> AuthOutcome {
    let Some(record) = state.directory.lookup(tunnel_id, &token) else {
        warn!(tunnel_id, "auth failed: invalid credentials");
        return AuthOutcome {
            response: ControlMessage::AuthResponse {
                success: false,
                public_port: None,
                protocol: None,
                message: None,
                error: Some(capitalize(&TunnelError::InvalidCredentials.to_string())),
                verification_url: None,
            },
            evicted: None,
        };
    };

    if !record.verified {
        warn!(tunnel_id, "auth failed: not verified");
        return AuthOutcome {
            response: ControlMessage::AuthResponse {
                success: false,
                public_port: None,
                protocol: None,
                message: None,
                error: Some(capitalize(
                    &TunnelError::NotVerified {
                        verification_url: format!("/verify/{}", record.verification_code),
                    }
                    .to_string(),
                )),
                verification_url: Some(format!("/verify/{}", record.verification_code)),
            },
            evicted: None,
        };
    }

    if let Err(e) = state
        .controller
        .start_listener(tunnel_id, record.public_port, record.protocol)
        .await
    {
        warn!(tunnel_id, error = %e, "auth failed: listener could not start");
        let error = match e {
            TunnelError::PortInUse(port) => format!("public port {port} is already in use"),
            TunnelError::ListenerBindFailure { port, source } => {
                format!("failed to bind public port {port}: {source}")
            }
            other => other.to_string(),
        };
        return AuthOutcome {
            response: ControlMessage::AuthResponse {
                success: false,
                public_port: None,
                protocol: None,
                message: None,
                error: Some(error),
                verification_url: None,
            },
            evicted: None,
        };
    }

    state.directory.mark_active(tunnel_id, now_unix());

    let evicted = state.sessions.install(
        tunnel_id,
        TunnelSession {
            control_channel_id: control_channel_id.to_string(),
            tx,
            local_port,
            public_port: record.public_port,
            protocol: record.protocol,
        },
    );

    info!(
        tunnel_id,
        public_port = record.public_port,
        protocol = %record.protocol,
        "tunnel authenticated"
    );

    AuthOutcome {
        response: ControlMessage::AuthResponse {
            success: true,
            public_port: Some(record.public_port),
            protocol: Some(record.protocol),
            message: Some(format!(
                "Tunnel active! {} traffic on port {} will forward to your local port {}",
                record.protocol, record.public_port, local_port
            )),
            error: None,
            verification_url: None,
        },
        evicted,
    }
}

/// `TunnelError`'s `Display` messages read like log lines ("invalid tunnel
/// credentials"); `original_source/app.py`'s `auth_response.error` strings
/// are sentence-cased. Bridges the two without duplicating the wording.
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
