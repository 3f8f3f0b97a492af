//! A single UDP flow: an ephemeral upstream socket bridged back to one
//! TUN-side 5-tuple, with IP-fragmenting replies for oversized responses.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::OutboundPacket;
use crate::packet::ipv4::Ipv4Header;
use crate::packet::udp::UdpHeader;

/// The 5-tuple identifying a UDP flow from the gateway's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpFlowKey {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl std::fmt::Display for UdpFlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// Idle timeout for flows classified as DNS traffic (destination port 53 or
/// 853, or redirected to the configured DNS server).
pub const DNS_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
/// Idle timeout for every other UDP flow.
pub const GENERAL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// `true` for the ports this gateway never bridges over UDP — QUIC on 80/443
/// is dropped rather than retried over TCP.
pub fn is_dropped_port(port: u16) -> bool {
    port == 80 || port == 443
}

fn is_dns_port(port: u16) -> bool {
    port == 53 || port == 853
}

pub struct UdpFlowTracker {
    pub flow: UdpFlowKey,
    input_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    destroyed: Arc<AtomicBool>,
}

impl UdpFlowTracker {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn feed(&self, datagram: Vec<u8>) {
        let _ = self.input_tx.send(datagram).await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Dials the flow's ephemeral upstream socket and spawns the tracker's
/// forward/reverse pump tasks.
pub async fn spawn(
    flow: UdpFlowKey,
    socket: UdpSocket,
    ttl: u8,
    to_tun: mpsc::Sender<OutboundPacket>,
    on_destroyed: impl Fn(UdpFlowKey) + Send + Sync + 'static,
) -> UdpFlowTracker {
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let cancel = CancellationToken::new();
    let destroyed = Arc::new(AtomicBool::new(false));
    let socket = Arc::new(socket);

    let idle_timeout = if is_dns_port(flow.remote_port) {
        DNS_IDLE_TIMEOUT
    } else {
        GENERAL_IDLE_TIMEOUT
    };

    {
        let socket = socket.clone();
        let cancel = cancel.clone();
        let destroyed = destroyed.clone();
        tokio::spawn(async move {
            let mut ip_id: u16 = 1;
            let mut recv_buf = vec![0u8; crate::buffer::MTU];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = tokio::time::sleep(idle_timeout) => {
                        debug!(%flow, "udp flow idle timeout");
                        break;
                    }

                    outbound = input_rx.recv() => {
                        let Some(payload) = outbound else { break };
                        if socket.send(&payload).await.is_err() {
                            break;
                        }
                    }

                    result = socket.recv(&mut recv_buf) => {
                        match result {
                            Ok(n) => {
                                emit_reply(&flow, ttl, &mut ip_id, &recv_buf[..n], &to_tun).await;
                            }
                            Err(e) => {
                                warn!(%flow, error = %e, "udp upstream read failed");
                                break;
                            }
                        }
                    }
                }
            }
            destroyed.store(true, Ordering::SeqCst);
            cancel.cancel();
            on_destroyed(flow);
            debug!(%flow, "udp tracker destroyed");
        });
    }

    UdpFlowTracker {
        flow,
        input_tx,
        cancel,
        destroyed,
    }
}

/// The chunk size a reply payload is split at before it needs IP
/// fragmentation (`MTU - 28`: 20 bytes of IPv4 header + 8 bytes of UDP
/// header).
const MAX_UNFRAGMENTED_PAYLOAD: usize = crate::buffer::MTU - 28;

async fn emit_reply(
    flow: &UdpFlowKey,
    ttl: u8,
    ip_id: &mut u16,
    payload: &[u8],
    to_tun: &mpsc::Sender<OutboundPacket>,
) {
    let (IpAddr::V4(remote), IpAddr::V4(local)) = (flow.remote_ip, flow.local_ip) else {
        // IPv6 UDP replies are sent unfragmented; this gateway never
        // reassembles/fragments IPv6 (see the fragment reassembler module).
        if let Some(datagram) = build_udp_datagram_v6(flow, ttl, payload) {
            let _ = to_tun.send(OutboundPacket::Udp(datagram)).await;
        }
        return;
    };

    let full_udp_len = 8 + payload.len();
    let udp_hdr = UdpHeader {
        src_port: flow.remote_port,
        dst_port: flow.local_port,
        length: full_udp_len as u16,
        checksum: 0,
    };
    let mut udp_bytes = vec![0u8; 8];
    let pseudo =
        crate::packet::checksum::ipv4_pseudo_header(remote, local, 17, full_udp_len as u16);
    udp_hdr.serialize(&mut udp_bytes, &pseudo, payload);

    let mut udp_datagram = Vec::with_capacity(full_udp_len);
    udp_datagram.extend_from_slice(&udp_bytes);
    udp_datagram.extend_from_slice(payload);

    if udp_datagram.len() <= MAX_UNFRAGMENTED_PAYLOAD {
        let template = Ipv4Header {
            ihl: 5,
            tos: 0,
            total_length: 0,
            identification: next_id(ip_id),
            flags: 0,
            fragment_offset: 0,
            ttl,
            protocol: 17,
            checksum: 0,
            src: remote,
            dst: local,
            options: vec![],
        };
        let mut hdr = template;
        hdr.total_length = (hdr.header_len() + udp_datagram.len()) as u16;
        let mut wire = vec![0u8; hdr.header_len()];
        hdr.serialize(&mut wire);
        wire.extend_from_slice(&udp_datagram);
        let _ = to_tun.send(OutboundPacket::Udp(wire)).await;
        return;
    }

    let template = Ipv4Header {
        ihl: 5,
        tos: 0,
        total_length: 0,
        identification: next_id(ip_id),
        flags: 0,
        fragment_offset: 0,
        ttl,
        protocol: 17,
        checksum: 0,
        src: remote,
        dst: local,
        options: vec![],
    };
    for (mut hdr, chunk) in crate::packet::fragment_payload(&template, crate::buffer::MTU, &udp_datagram) {
        hdr.total_length = (hdr.header_len() + chunk.len()) as u16;
        let mut wire = vec![0u8; hdr.header_len()];
        hdr.serialize(&mut wire);
        wire.extend_from_slice(&chunk);
        let _ = to_tun.send(OutboundPacket::Udp(wire)).await;
    }
}

fn build_udp_datagram_v6(flow: &UdpFlowKey, ttl: u8, payload: &[u8]) -> Option<Vec<u8>> {
    let (IpAddr::V6(remote), IpAddr::V6(local)) = (flow.remote_ip, flow.local_ip) else {
        return None;
    };
    let full_udp_len = 8 + payload.len();
    let pseudo = crate::packet::checksum::ipv6_pseudo_header(remote, local, 17, full_udp_len as u32);
    let udp_hdr = UdpHeader {
        src_port: flow.remote_port,
        dst_port: flow.local_port,
        length: full_udp_len as u16,
        checksum: 0,
    };
    let mut udp_bytes = vec![0u8; 8];
    udp_hdr.serialize(&mut udp_bytes, &pseudo, payload);

    let ip_hdr = crate::packet::ipv6::Ipv6Header {
        traffic_class: 0,
        flow_label: 0,
        payload_length: full_udp_len as u16,
        next_header: 17,
        hop_limit: ttl,
        src: remote,
        dst: local,
    };
    let mut wire = vec![0u8; crate::packet::ipv6::Ipv6Header::LEN];
    ip_hdr.serialize(&mut wire);
    wire.extend_from_slice(&udp_bytes);
    wire.extend_from_slice(payload);
    Some(wire)
}

fn next_id(counter: &mut u16) -> u16 {
    let id = *counter;
    *counter = counter.wrapping_add(1);
    id
}
