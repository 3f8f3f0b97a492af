//! The TUN device's single reader and single writer.
//!
//! Exactly one task owns the fd for reads; exactly one task owns it for
//! writes. Every other task that wants to emit a packet does so by sending
//! an [`OutboundPacket`] into the writer's queue rather than touching the
//! fd directly — this is what gives flows their per-5-tuple total write
//! order without a lock shared across flows.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::buffer::MTU;
use crate::error::{GatewayError, Result};

/// A packet queued for the TUN writer. Carries already-serialized wire
/// bytes; the writer doesn't know or care whether it's a TCP segment, a UDP
/// datagram, or an IPv4 fragment — it only writes bytes in arrival order.
#[derive(Debug)]
pub enum OutboundPacket {
    Tcp(Vec<u8>),
    Udp(Vec<u8>),
    Raw(Vec<u8>),
}

impl OutboundPacket {
    fn as_bytes(&self) -> &[u8] {
        match self {
            OutboundPacket::Tcp(b) | OutboundPacket::Udp(b) | OutboundPacket::Raw(b) => b,
        }
    }
}

/// Bound on the writer's queue — backpressure point for every flow; a flow
/// stalled writing to a wedged TUN device blocks on this send rather than
/// growing memory without limit.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// A raw, non-blocking TUN file descriptor wrapped for use with tokio's
/// reactor.
pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
}

impl TunDevice {
    pub fn from_fd(fd: OwnedFd) -> std::io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(TunDevice {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Reads one packet off the device into `buf`, returning the number of
    /// bytes read.
    pub async fn read_packet(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| read_raw(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> std::io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| write_raw(inner.get_ref().as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn read_raw(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_raw(fd: RawFd, buf: &[u8]) -> std::io::Result<()> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
    if n < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Drives the single writer task: drains `rx` and writes each packet to
/// `device` in arrival order.
pub async fn run_writer(device: std::sync::Arc<TunDevice>, mut rx: mpsc::Receiver<OutboundPacket>) {
    while let Some(pkt) = rx.recv().await {
        if let Err(e) = device.write_packet(pkt.as_bytes()).await {
            warn!(error = %e, "failed writing packet to TUN device");
        }
    }
    debug!("TUN writer task exiting: queue closed");
}

/// Drives the single reader task: reads packets off `device` and hands
/// each one to `dispatch`.
pub async fn run_reader<F, Fut>(device: std::sync::Arc<TunDevice>, mut dispatch: F) -> Result<()>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut buf = vec![0u8; MTU];
    loop {
        let n = device.read_packet(&mut buf).await.map_err(GatewayError::Io)?;
        if n == 0 {
            continue;
        }
        dispatch(buf[..n].to_vec()).await;
    }
}
