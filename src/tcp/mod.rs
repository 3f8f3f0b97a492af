//! The TCP flow engine: dispatches incoming TUN segments to per-flow
//! trackers, creating a tracker (and dialing its upstream) on a fresh SYN
//! and answering anything else addressed to an unknown flow with a RST.

pub mod segment;
pub mod state;
pub mod tracker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use self::segment::{FlowKey, SegmentBuilder};
use self::state::Segment;
use self::tracker::{Inbound, TcpTracker};
use crate::device::OutboundPacket;
use crate::dialer::direct::TransparentDialer;
use crate::dialer::http_connect::HttpConnectDialer;
use crate::dialer::socks5::Socks5Dialer;
use crate::dialer::tls::TlsDialer;
use crate::dialer::Dialer;
use crate::packet::tcp::TcpHeader;
use crate::proxy::{ProxyKind, ProxySelector};
use crate::uid::UidResolver;

/// Builds the dialer a given proxy descriptor's kind requires.
fn build_dialer(address: SocketAddr, kind: &ProxyKind) -> Arc<dyn Dialer> {
    match kind {
        ProxyKind::Socks5 { username, password } => Arc::new(Socks5Dialer {
            proxy_addr: address,
            username: username.clone(),
            password: password.clone(),
        }),
        ProxyKind::HttpConnect { auth_header } => Arc::new(HttpConnectDialer {
            proxy_addr: address,
            auth_header: auth_header.clone(),
        }),
        ProxyKind::Tls => Arc::new(TlsDialer::new(address, address.ip().to_string())),
        ProxyKind::Transparent => Arc::new(TransparentDialer),
    }
}

/// Dispatches TUN-side TCP segments to per-flow trackers and owns their
/// lifecycle.
pub struct TcpEngine {
    trackers: Mutex<HashMap<FlowKey, Arc<TcpTracker>>>,
    to_tun: mpsc::Sender<OutboundPacket>,
    uid_resolver: Arc<UidResolver>,
    proxy_selector: Arc<std::sync::RwLock<ProxySelector>>,
    default_ttl: u8,
}

impl TcpEngine {
    pub fn new(
        to_tun: mpsc::Sender<OutboundPacket>,
        uid_resolver: Arc<UidResolver>,
        proxy_selector: Arc<std::sync::RwLock<ProxySelector>>,
    ) -> Arc<Self> {
        Arc::new(TcpEngine {
            trackers: Mutex::new(HashMap::new()),
            to_tun,
            uid_resolver,
            proxy_selector,
            default_ttl: 64,
        })
    }

    /// Feeds one parsed TCP segment in off the TUN device.
    pub async fn handle_segment(
        self: &Arc<Self>,
        flow: FlowKey,
        tcp: &TcpHeader,
        payload: Vec<u8>,
    ) {
        let existing = {
            let trackers = self.trackers.lock().await;
            trackers.get(&flow).cloned()
        };

        if let Some(tracker) = existing {
            if tracker.is_destroyed() {
                self.trackers.lock().await.remove(&flow);
            } else {
                let seg = to_state_segment(tcp, payload.len() as u32);
                tracker
                    .feed(Inbound {
                        seg,
                        window: tcp.window,
                        payload,
                    })
                    .await;
                return;
            }
        }

        if tcp.flags.syn && !tcp.flags.ack {
            self.spawn_flow(flow, tcp.seq).await;
            return;
        }

        if tcp.flags.rst {
            return; // never answer an unknown RST with a RST
        }

        debug!(%flow, "segment for unknown flow, replying with RST");
        let rst = SegmentBuilder::rst_for(
            flow,
            self.default_ttl,
            1,
            tcp.seq,
            tcp.ack,
            tcp.flags.ack,
            payload.len() as u32,
        );
        let _ = self.to_tun.send(OutboundPacket::Tcp(rst)).await;
    }

    async fn spawn_flow(self: &Arc<Self>, flow: FlowKey, client_isn: u32) {
        let uid = self.uid_resolver.resolve(
            flow.local_ip,
            flow.local_port,
            flow.remote_ip,
            flow.remote_port,
        );
        let proxy = {
            let selector = self.proxy_selector.read().expect("proxy selector lock");
            selector.select(uid, flow.remote_ip, flow.remote_port)
        };
        let Some(proxy) = proxy else {
            warn!(%flow, %uid, "no proxy configured for flow, dropping SYN");
            return;
        };

        let engine = self.clone();
        let to_tun = self.to_tun.clone();
        let default_ttl = self.default_ttl;
        tokio::spawn(async move {
            let dialer = build_dialer(proxy.address, &proxy.kind);
            let target = SocketAddr::new(flow.remote_ip, flow.remote_port);
            let stream = match dialer.dial(target).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%flow, error = %e, "dial failed, resetting flow");
                    let rst = SegmentBuilder::rst_for(flow, default_ttl, 1, client_isn, 0, false, 0);
                    let _ = to_tun.send(OutboundPacket::Tcp(rst)).await;
                    return;
                }
            };

            let trackers_for_cleanup = engine.clone();
            let tracker = tracker::spawn(
                flow,
                proxy,
                stream,
                client_isn,
                to_tun,
                move |flow| {
                    let trackers_for_cleanup = trackers_for_cleanup.clone();
                    tokio::spawn(async move {
                        trackers_for_cleanup.trackers.lock().await.remove(&flow);
                    });
                },
            );
            engine.trackers.lock().await.insert(flow, Arc::new(tracker));
        });
    }

    /// Number of flows currently tracked, for janitor reporting.
    pub async fn live_flow_count(&self) -> usize {
        self.trackers.lock().await.len()
    }

    /// Cancels every live tracker, used on shutdown.
    pub async fn shutdown(&self) {
        let trackers = self.trackers.lock().await;
        for tracker in trackers.values() {
            tracker.cancel();
        }
    }
}

fn to_state_segment(tcp: &TcpHeader, payload_len: u32) -> Segment {
    Segment {
        seq: tcp.seq,
        ack: tcp.ack,
        syn: tcp.flags.syn,
        ack_flag: tcp.flags.ack,
        fin: tcp.flags.fin,
        rst: tcp.flags.rst,
        payload_len,
    }
}
