//! Error kinds for the tunnel data plane, per the propagation policy:
//! handler-local errors terminate only that connection, listener-level
//! errors terminate only that listener, authentication errors are surfaced
//! to the client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("public port {0} is already in use by another tunnel")]
    PortInUse(u16),

    #[error("public port {port} is outside the configured range {range_start}-{range_end}")]
    PortOutOfRange {
        port: u16,
        range_start: u16,
        range_end: u16,
    },

    #[error("invalid tunnel credentials")]
    InvalidCredentials,

    #[error("tunnel not verified")]
    NotVerified { verification_url: String },

    #[error("failed to bind listener on port {port}: {source}")]
    ListenerBindFailure {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}
