//! Upstream dialers: SOCKS5, HTTP CONNECT, TLS-wrapped, and direct/transparent.
//!
//! Grounded in a small trait over `tokio` sockets (the shape this pack's
//! `firezone-firezone` socket-factory crate uses) rather than a concrete
//! enum of connectors, since the proxy-kind-to-dialer mapping is itself
//! data (see [`crate::proxy::ProxySelector`]).

pub mod direct;
pub mod http_connect;
pub mod socks5;
pub mod tls;

use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{GatewayError, Result};

/// Every dial path enforces this timeout, mapping a slow/absent upstream to
/// [`GatewayError::UpstreamUnreachable`].
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream that is both readable and writable — the trait-object form
/// `tokio::io`'s separate `AsyncRead`/`AsyncWrite` traits don't give you
/// directly, since a `dyn` object can only name one non-auto trait.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A dialed upstream connection, type-erased so the TCP flow engine can
/// treat a SOCKS5 tunnel, a TLS tunnel, and a bare TCP stream identically.
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Dials an upstream and returns a ready-to-use bidirectional stream.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: SocketAddr) -> Result<BoxedStream>;
}

pub(crate) async fn with_dial_timeout<F, T>(target: SocketAddr, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(DIAL_TIMEOUT, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(GatewayError::UpstreamUnreachable {
            target,
            cause: Some(e),
        }),
        Err(_) => Err(GatewayError::UpstreamUnreachable {
            target,
            cause: None,
        }),
    }
}
