//! Exercises [`TcpEngine`] itself (not just a pre-dialed tracker): a SYN to
//! a destination nothing is listening on must come back as a RST, and the
//! flow must not be left behind in the engine's table.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tun_gateway::device::OutboundPacket;
use tun_gateway::packet::tcp::{parse as parse_tcp, TcpFlags, TcpHeader, TcpOptions};
use tun_gateway::proxy::ProxySelector;
use tun_gateway::tcp::segment::FlowKey;
use tun_gateway::tcp::TcpEngine;
use tun_gateway::uid::UidResolver;

/// Binds a listener to get a free loopback port, then drops it immediately
/// so nothing answers a subsequent connect to that port.
async fn unreachable_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn syn_header(src_port: u16, dst_port: u16, seq: u32) -> TcpHeader {
    TcpHeader {
        src_port,
        dst_port,
        seq,
        ack: 0,
        data_offset: 5,
        flags: TcpFlags {
            fin: false,
            syn: true,
            rst: false,
            psh: false,
            ack: false,
            urg: false,
        },
        window: 65535,
        checksum: 0,
        urgent_pointer: 0,
        options: TcpOptions::default(),
    }
}

#[tokio::test]
async fn syn_to_closed_port_resets_and_does_not_leak_the_flow() {
    let dst_port = unreachable_port().await;
    let flow = FlowKey {
        local_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
        local_port: 55123,
        remote_ip: "127.0.0.1".parse::<IpAddr>().unwrap(),
        remote_port: dst_port,
    };

    let (to_tun_tx, mut to_tun_rx) = mpsc::channel(16);
    let uid_resolver = Arc::new(UidResolver::new(None));
    let proxy_selector = Arc::new(RwLock::new(ProxySelector::new()));
    let engine = TcpEngine::new(to_tun_tx, uid_resolver, proxy_selector);

    let syn = syn_header(flow.local_port, flow.remote_port, 500);
    engine.handle_segment(flow, &syn, vec![]).await;

    let rst_bytes = tokio::time::timeout(Duration::from_secs(2), to_tun_rx.recv())
        .await
        .expect("timed out waiting for a RST after a failed dial")
        .expect("to_tun channel closed");
    let OutboundPacket::Tcp(rst_bytes) = rst_bytes else {
        panic!("expected a TCP outbound packet");
    };
    let (hdr, _) = parse_tcp(&rst_bytes).unwrap();
    assert!(hdr.flags.rst);
    assert_eq!(hdr.seq, 0, "a RST for a SYN the gateway never acked must carry seq=0");
    assert_eq!(hdr.ack, 501, "ack must cover the client's ISN (500) + 1, per the opening SYN");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.live_flow_count().await, 0);
}
