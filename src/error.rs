//! Crate-wide error type.
//!
//! Mirrors the shape of a hand-written, context-carrying error enum: no
//! `anyhow`/`thiserror`, each variant carries what a caller needs to act on
//! it without reaching back into logs.

use std::fmt;
use std::net::SocketAddr;

use crate::packet::CodecError;

/// Errors produced while driving a TUN flow to an upstream proxy.
#[derive(Debug)]
pub enum GatewayError {
    /// The wire bytes did not parse as a well-formed IPv4/IPv6/TCP/UDP packet.
    Codec(CodecError),

    /// Dialing the configured upstream did not complete within the configured timeout.
    UpstreamUnreachable {
        /// Address that was being dialed.
        target: SocketAddr,
        /// Underlying I/O failure, if the dial failed rather than timed out.
        cause: Option<std::io::Error>,
    },

    /// The upstream refused the proxy handshake (bad SOCKS5 reply code, TLS
    /// handshake failure, non-2xx CONNECT, ...).
    ProxyHandshakeFailed {
        /// Which proxy kind was being spoken.
        kind: &'static str,
        /// Human-readable detail from the handshake.
        detail: String,
    },

    /// An I/O error occurred reading from or writing to the TUN device or an
    /// upstream socket.
    Io(std::io::Error),

    /// A flow tracker received a packet or event after it had already been
    /// destroyed.
    FlowGone {
        /// Flow 5-tuple as a display string, for logging.
        flow_id: String,
    },

    /// The embedder API was used out of order (e.g. `run` called twice).
    InvalidConfiguration(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Codec(e) => write!(f, "packet codec error: {e}"),
            GatewayError::UpstreamUnreachable { target, cause } => match cause {
                Some(e) => write!(f, "upstream {target} unreachable: {e}"),
                None => write!(f, "upstream {target} unreachable: timed out"),
            },
            GatewayError::ProxyHandshakeFailed { kind, detail } => {
                write!(f, "{kind} handshake failed: {detail}")
            }
            GatewayError::Io(e) => write!(f, "i/o error: {e}"),
            GatewayError::FlowGone { flow_id } => {
                write!(f, "flow {flow_id} no longer tracked")
            }
            GatewayError::InvalidConfiguration(msg) => {
                write!(f, "invalid configuration: {msg}")
            }
        }
    }
}

impl std::error::Error for GatewayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GatewayError::Codec(e) => Some(e),
            GatewayError::UpstreamUnreachable { cause: Some(e), .. } => Some(e),
            GatewayError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for GatewayError {
    fn from(e: CodecError) -> Self {
        GatewayError::Codec(e)
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
