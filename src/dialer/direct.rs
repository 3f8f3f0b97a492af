//! Transparent (no-proxy) TCP and UDP dialing.

use std::net::SocketAddr;

use tokio::net::{TcpStream, UdpSocket};

use super::{with_dial_timeout, BoxedStream, Dialer};
use crate::error::Result;

/// Dials the flow's own destination directly.
pub struct TransparentDialer;

#[async_trait::async_trait]
impl Dialer for TransparentDialer {
    async fn dial(&self, target: SocketAddr) -> Result<BoxedStream> {
        let stream = with_dial_timeout(target, TcpStream::connect(target)).await?;
        Ok(Box::pin(stream))
    }
}

/// Binds an ephemeral local UDP socket and connects it to `target`, for the
/// UDP flow engine's direct-relay path.
pub async fn dial_udp(target: SocketAddr) -> Result<UdpSocket> {
    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = with_dial_timeout(target, UdpSocket::bind(bind_addr)).await?;
    with_dial_timeout(target, async { socket.connect(target).await.map(|_| ()) }).await?;
    Ok(socket)
}
