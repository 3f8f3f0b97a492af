#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod config;
pub mod device;
pub mod dialer;
pub mod error;
pub mod fragment;
pub mod janitor;
pub mod packet;
pub mod proxy;
pub mod tcp;
pub mod udp;
pub mod uid;

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use config::{GatewayBuilder, GatewayConfig};
pub use error::{GatewayError, Result};

use device::{OutboundPacket, TunDevice};
use fragment::FragmentReassembler;
use packet::IpHeader;
use proxy::{ProxyDescriptor, ProxySelector};
use tcp::segment::FlowKey;
use tcp::TcpEngine;
use udp::tracker::UdpFlowKey;
use udp::UdpEngine;
use uid::{UidCallback, UidResolver};

/// A user-mode TUN gateway: reads IPv4/IPv6 packets off a TUN device,
/// bridges their TCP and UDP flows to upstream proxies (SOCKS5,
/// HTTP-CONNECT, TLS, or a direct/transparent dial), and writes replies
/// back as synthesized packets.
///
/// Construction follows the accumulate-then-run shape the embedder drives:
/// `set_dns_server` → `set_default_proxy` → `add_proxy` (repeatable) →
/// `set_uid_callback` → `run`.
///
/// # Examples
///
/// ```no_run
/// use tun_gateway::{Gateway, GatewayConfig};
/// use tun_gateway::proxy::{ProxyDescriptor, ProxyKind};
///
/// # async fn run(fd: std::os::fd::OwnedFd) -> tun_gateway::Result<()> {
/// let mut gateway = Gateway::new(GatewayConfig::default());
/// gateway.set_default_proxy(ProxyDescriptor {
///     address: "203.0.113.1:1080".parse().unwrap(),
///     kind: ProxyKind::Socks5 { username: None, password: None },
/// });
/// gateway.run(fd).await
/// # }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    proxy_selector: Arc<RwLock<ProxySelector>>,
    uid_callback: Option<UidCallback>,
    dns_server: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Gateway {
            config,
            proxy_selector: Arc::new(RwLock::new(ProxySelector::new())),
            uid_callback: None,
            dns_server: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Redirects DNS-classified UDP flows (destination port 53 or 853) to a
    /// fixed resolver instead of their own destination.
    pub fn set_dns_server(&mut self, server: Option<SocketAddr>) -> &mut Self {
        self.dns_server = server;
        self
    }

    /// Sets the proxy used for flows with no UID-specific override.
    pub fn set_default_proxy(&mut self, descriptor: ProxyDescriptor) -> &mut Self {
        self.proxy_selector
            .write()
            .expect("proxy selector lock")
            .set_default(descriptor);
        self
    }

    /// Adds a per-UID proxy override.
    pub fn add_proxy(&mut self, uid: i64, descriptor: ProxyDescriptor) -> &mut Self {
        self.proxy_selector
            .write()
            .expect("proxy selector lock")
            .add_for_uid(uid, descriptor);
        self
    }

    /// Supplies a host callback for UID resolution, bypassing `/proc/net/tcp`
    /// parsing.
    pub fn set_uid_callback(&mut self, callback: UidCallback) -> &mut Self {
        self.uid_callback = Some(callback);
        self
    }

    /// Signals every running task to stop. `run` returns once shutdown has
    /// drained.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Takes ownership of an already-opened TUN file descriptor and runs
    /// the gateway until `stop` is called or the device errors out.
    pub async fn run(&self, fd: OwnedFd) -> Result<()> {
        let device = Arc::new(TunDevice::from_fd(fd)?);

        let (to_tun_tx, to_tun_rx) = mpsc::channel(device::WRITE_QUEUE_CAPACITY);
        tokio::spawn(device::run_writer(device.clone(), to_tun_rx));

        let uid_resolver = Arc::new(UidResolver::new(self.uid_callback.clone()));
        let tcp_engine = TcpEngine::new(to_tun_tx.clone(), uid_resolver, self.proxy_selector.clone());
        let udp_engine = UdpEngine::new(to_tun_tx.clone());
        udp_engine.set_dns_server(self.dns_server);

        let fragments = Arc::new(Mutex::new(FragmentReassembler::new()));

        tokio::spawn(janitor::run(
            tcp_engine.clone(),
            udp_engine.clone(),
            fragments.clone(),
            self.shutdown.clone(),
        ));

        let reader_tcp = tcp_engine.clone();
        let reader_udp = udp_engine.clone();
        let reader_fragments = fragments.clone();
        let reader_device = device.clone();

        let result = tokio::select! {
            r = device::run_reader(reader_device, move |bytes| {
                let tcp_engine = reader_tcp.clone();
                let udp_engine = reader_udp.clone();
                let fragments = reader_fragments.clone();
                async move {
                    dispatch_packet(bytes, &tcp_engine, &udp_engine, &fragments).await;
                }
            }) => r,
            _ = self.shutdown.cancelled() => Ok(()),
        };

        tcp_engine.shutdown().await;
        udp_engine.shutdown().await;
        result
    }
}

/// Parses one raw packet off the TUN device, reassembling IPv4 fragments
/// and routing the completed TCP segment or UDP datagram to its engine.
async fn dispatch_packet(
    bytes: Vec<u8>,
    tcp: &Arc<TcpEngine>,
    udp: &Arc<UdpEngine>,
    fragments: &Arc<Mutex<FragmentReassembler>>,
) {
    let (ip_header, ip_payload) = match packet::parse_ip(&bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "dropping unparseable packet");
            return;
        }
    };

    let (ip_header, payload): (IpHeader, Vec<u8>) = match ip_header {
        IpHeader::V4(v4) => {
            let mut guard = fragments.lock().await;
            match guard.feed(v4, ip_payload) {
                Some((hdr, payload)) => (IpHeader::V4(hdr), payload),
                None => return,
            }
        }
        IpHeader::V6(v6) => (IpHeader::V6(v6), ip_payload.to_vec()),
    };

    match ip_header.protocol() {
        packet::PROTO_TCP => {
            let (tcp_hdr, tcp_payload) = match packet::tcp::parse(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable TCP segment");
                    return;
                }
            };
            let flow = FlowKey {
                local_ip: ip_header.src(),
                local_port: tcp_hdr.src_port,
                remote_ip: ip_header.dst(),
                remote_port: tcp_hdr.dst_port,
            };
            tcp.handle_segment(flow, &tcp_hdr, tcp_payload.to_vec()).await;
        }
        packet::PROTO_UDP => {
            let (udp_hdr, udp_payload) = match packet::udp::parse(&payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dropping unparseable UDP datagram");
                    return;
                }
            };
            let flow = UdpFlowKey {
                local_ip: ip_header.src(),
                local_port: udp_hdr.src_port,
                remote_ip: ip_header.dst(),
                remote_port: udp_hdr.dst_port,
            };
            udp.handle_datagram(flow, udp_payload.to_vec()).await;
        }
        other => {
            let _ = other; // neither TCP nor UDP; nothing in this gateway's scope handles it
        }
    }
}
