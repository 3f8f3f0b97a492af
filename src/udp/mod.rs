//! The UDP flow engine: dispatches inbound TUN datagrams to per-5-tuple
//! trackers, with an optional DNS-server redirect and a hard drop for ports
//! 80/443 (QUIC is not bridged over this gateway's UDP path).

pub mod tracker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use self::tracker::{is_dropped_port, UdpFlowKey, UdpFlowTracker};
use crate::device::OutboundPacket;
use crate::dialer::direct::dial_udp;

/// Dispatches TUN-side UDP datagrams to per-flow trackers.
pub struct UdpEngine {
    trackers: Mutex<HashMap<UdpFlowKey, Arc<UdpFlowTracker>>>,
    to_tun: mpsc::Sender<OutboundPacket>,
    dns_server: std::sync::RwLock<Option<SocketAddr>>,
    default_ttl: u8,
}

impl UdpEngine {
    pub fn new(to_tun: mpsc::Sender<OutboundPacket>) -> Arc<Self> {
        Arc::new(UdpEngine {
            trackers: Mutex::new(HashMap::new()),
            to_tun,
            dns_server: std::sync::RwLock::new(None),
            default_ttl: 64,
        })
    }

    /// Redirects DNS-classified flows (destination port 53/853) to a fixed
    /// upstream resolver instead of the packet's own destination.
    pub fn set_dns_server(&self, server: Option<SocketAddr>) {
        *self.dns_server.write().expect("dns server lock") = server;
    }

    /// Feeds one UDP datagram (with its original destination, before any
    /// DNS redirect) in off the TUN device.
    pub async fn handle_datagram(self: &Arc<Self>, flow: UdpFlowKey, payload: Vec<u8>) {
        if is_dropped_port(flow.remote_port) {
            debug!(%flow, "dropping UDP to a QUIC-reserved port");
            return;
        }

        let existing = {
            let trackers = self.trackers.lock().await;
            trackers.get(&flow).cloned()
        };

        if let Some(tracker) = existing {
            if !tracker.is_destroyed() {
                tracker.feed(payload).await;
                return;
            }
            self.trackers.lock().await.remove(&flow);
        }

        self.spawn_flow(flow, payload).await;
    }

    async fn spawn_flow(self: &Arc<Self>, flow: UdpFlowKey, first_datagram: Vec<u8>) {
        let target = self.resolve_target(flow);
        let engine = self.clone();
        let to_tun = self.to_tun.clone();
        let default_ttl = self.default_ttl;
        tokio::spawn(async move {
            let socket = match dial_udp(target).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%flow, error = %e, "udp dial failed, dropping flow");
                    return;
                }
            };

            let trackers_for_cleanup = engine.clone();
            let tracker = tracker::spawn(flow, socket, default_ttl, to_tun, move |flow| {
                let trackers_for_cleanup = trackers_for_cleanup.clone();
                tokio::spawn(async move {
                    trackers_for_cleanup.trackers.lock().await.remove(&flow);
                });
            })
            .await;
            tracker.feed(first_datagram).await;
            engine.trackers.lock().await.insert(flow, Arc::new(tracker));
        });
    }

    fn resolve_target(&self, flow: UdpFlowKey) -> SocketAddr {
        let is_dns = flow.remote_port == 53 || flow.remote_port == 853;
        if is_dns {
            if let Some(server) = *self.dns_server.read().expect("dns server lock") {
                return server;
            }
        }
        SocketAddr::new(flow.remote_ip, flow.remote_port)
    }

    /// Number of flows currently tracked, for janitor reporting.
    pub async fn live_flow_count(&self) -> usize {
        self.trackers.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let trackers = self.trackers.lock().await;
        for tracker in trackers.values() {
            tracker.cancel();
        }
    }
}
