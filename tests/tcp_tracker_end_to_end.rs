//! Drives a [`TcpTracker`] end to end against an in-memory duplex stream
//! standing in for the dialed upstream connection, so these tests never
//! touch a real socket.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use tun_gateway::device::OutboundPacket;
use tun_gateway::packet::tcp::parse as parse_tcp;
use tun_gateway::proxy::{ProxyDescriptor, ProxyKind};
use tun_gateway::tcp::segment::FlowKey;
use tun_gateway::tcp::tracker::{self, Inbound};
use tun_gateway::tcp::state::{Segment, IDLE_TIMEOUT};

fn flow() -> FlowKey {
    FlowKey {
        local_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
        local_port: 51000,
        remote_ip: "93.184.216.34".parse::<IpAddr>().unwrap(),
        remote_port: 443,
    }
}

fn transparent_proxy() -> ProxyDescriptor {
    ProxyDescriptor {
        address: "93.184.216.34:443".parse().unwrap(),
        kind: ProxyKind::Transparent,
    }
}

fn syn_ack_segment(rst: bool, ack_flag: bool, syn: bool, fin: bool, seq: u32, ack: u32, payload_len: u32) -> Segment {
    Segment { seq, ack, syn, ack_flag, fin, rst, payload_len }
}

async fn next_tcp_packet(to_tun_rx: &mut mpsc::Receiver<OutboundPacket>) -> Vec<u8> {
    match tokio::time::timeout(Duration::from_secs(1), to_tun_rx.recv())
        .await
        .expect("timed out waiting for outbound packet")
        .expect("to_tun channel closed")
    {
        OutboundPacket::Tcp(bytes) => bytes,
        other => panic!("expected a TCP outbound packet, got {other:?}"),
    }
}

/// Spawns a tracker wired to one end of an in-memory duplex pipe, returning
/// the tracker, the peer end of the pipe (standing in for the upstream
/// socket), and the channel the gateway would otherwise hand to the TUN
/// writer.
fn spawn_test_tracker(client_isn: u32) -> (
    Arc<tracker::TcpTracker>,
    tokio::io::DuplexStream,
    mpsc::Receiver<OutboundPacket>,
) {
    let (upstream_side, gateway_side) = tokio::io::duplex(4096);
    let (to_tun_tx, to_tun_rx) = mpsc::channel(32);
    let destroyed = Arc::new(AtomicBool::new(false));
    let flag_for_cb = destroyed.clone();
    let tracker = tracker::spawn(
        flow(),
        transparent_proxy(),
        Box::pin(gateway_side),
        client_isn,
        to_tun_tx,
        move |_flow| flag_for_cb.store(true, Ordering::SeqCst),
    );
    (Arc::new(tracker), upstream_side, to_tun_rx)
}

#[tokio::test]
async fn three_way_handshake_completes_and_data_relays_upstream() {
    let client_isn = 1000u32;
    let (tracker, mut upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let syn_ack_bytes = next_tcp_packet(&mut to_tun_rx).await;
    let (hdr, _) = parse_tcp(&syn_ack_bytes).unwrap();
    assert!(hdr.flags.syn && hdr.flags.ack);

    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 5),
            window: 65535,
            payload: b"hello".to_vec(),
        })
        .await;

    let mut received = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(1), upstream.read_exact(&mut received))
        .await
        .expect("timed out reading relayed payload")
        .unwrap();
    assert_eq!(&received, b"hello");
}

#[tokio::test]
async fn upstream_data_is_wrapped_in_a_tcp_segment_toward_the_client() {
    let client_isn = 2000u32;
    let (tracker, mut upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let _syn_ack = next_tcp_packet(&mut to_tun_rx).await;
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    upstream.write_all(b"response-bytes").await.unwrap();

    let segment_bytes = next_tcp_packet(&mut to_tun_rx).await;
    let (hdr, payload) = parse_tcp(&segment_bytes).unwrap();
    assert!(hdr.flags.psh && hdr.flags.ack);
    assert_eq!(payload, b"response-bytes");
}

#[tokio::test]
async fn upstream_eof_drives_server_initiated_close() {
    let client_isn = 3000u32;
    let (tracker, upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let _syn_ack = next_tcp_packet(&mut to_tun_rx).await;
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    drop(upstream); // upstream half closes -> read returns EOF

    let fin_bytes = next_tcp_packet(&mut to_tun_rx).await;
    let (hdr, _) = parse_tcp(&fin_bytes).unwrap();
    assert!(hdr.flags.fin && hdr.flags.ack);
}

#[tokio::test]
async fn server_initiated_close_survives_an_ack_only_before_the_peers_separate_fin() {
    let client_isn = 5000u32;
    let (tracker, upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let _syn_ack = next_tcp_packet(&mut to_tun_rx).await;
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    drop(upstream);
    let fin_bytes = next_tcp_packet(&mut to_tun_rx).await;
    let (fin_hdr, _) = parse_tcp(&fin_bytes).unwrap();
    assert!(fin_hdr.flags.fin && fin_hdr.flags.ack);

    // Peer acks the FIN on its own first, without yet sending its own FIN.
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), fin_hdr.seq.wrapping_add(1), 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!tracker.is_destroyed(), "FIN_WAIT_2 must stay alive waiting for the peer's own FIN");

    // Now the peer's own FIN arrives as a separate segment.
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, true, false, client_isn.wrapping_add(1), fin_hdr.seq.wrapping_add(1), 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    let ack_bytes = next_tcp_packet(&mut to_tun_rx).await;
    let (ack_hdr, _) = parse_tcp(&ack_bytes).unwrap();
    assert!(ack_hdr.flags.ack && !ack_hdr.flags.rst, "the peer's own FIN must be acked, not reset");

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(tracker.is_destroyed(), "tracker must be torn down after TIME_WAIT once the close completes");
}

#[tokio::test(start_paused = true)]
async fn established_flow_idle_past_the_timeout_is_reaped() {
    let client_isn = 6000u32;
    let (tracker, _upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let _syn_ack = next_tcp_packet(&mut to_tun_rx).await;
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
    tokio::task::yield_now().await;
    assert!(tracker.is_destroyed(), "an established flow with no traffic must be reaped past IDLE_TIMEOUT");
}

#[tokio::test]
async fn rst_from_the_tun_side_tears_the_tracker_down_without_a_reply() {
    let client_isn = 4000u32;
    let (tracker, _upstream, mut to_tun_rx) = spawn_test_tracker(client_isn);

    let _syn_ack = next_tcp_packet(&mut to_tun_rx).await;
    tracker
        .feed(Inbound {
            seg: syn_ack_segment(false, true, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    tracker
        .feed(Inbound {
            seg: syn_ack_segment(true, false, false, false, client_isn.wrapping_add(1), 1, 0),
            window: 65535,
            payload: vec![],
        })
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tracker.is_destroyed());
    assert!(to_tun_rx.try_recv().is_err(), "a peer RST must never be answered with a reply");
}
