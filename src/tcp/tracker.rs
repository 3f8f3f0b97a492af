//! Per-flow TCP tracker: three cooperating tasks (state machine, upstream
//! writer, upstream reader) standing in for the reference implementation's
//! goroutine trio, talking over channels instead of back-pointers into a
//! shared struct.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::segment::{FlowKey, SegmentBuilder};
use super::state::{self, Action, Segment, TcpState, ACK_DELAY, IDLE_TIMEOUT, TIME_WAIT_DURATION};
use crate::device::OutboundPacket;
use crate::dialer::BoxedStream;
use crate::proxy::{ProxyDescriptor, ProxyKind};

pub const MAX_WINDOW: i32 = 65535;

/// One incoming TCP segment plus its payload, as handed from the engine's
/// dispatch loop to a tracker's state task.
pub struct Inbound {
    pub seg: Segment,
    pub window: u16,
    pub payload: Vec<u8>,
}

struct Windows {
    recv_window: AtomicI32,
    send_window: AtomicI32,
    send_window_notify: Notify,
}

impl Windows {
    fn new() -> Self {
        Windows {
            recv_window: AtomicI32::new(MAX_WINDOW),
            send_window: AtomicI32::new(MAX_WINDOW),
            send_window_notify: Notify::new(),
        }
    }

    fn grow_recv(&self, n: i32) {
        let _ = self
            .recv_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                Some((w + n).min(MAX_WINDOW))
            });
    }

    fn shrink_recv(&self, n: i32) {
        let _ = self
            .recv_window
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| Some((w - n).max(0)));
    }

    fn set_send(&self, v: i32) {
        self.send_window.store(v, Ordering::SeqCst);
        self.send_window_notify.notify_waiters();
    }

    async fn take_send_budget(&self, max: i32) -> i32 {
        loop {
            let current = self.send_window.load(Ordering::SeqCst);
            if current > 0 {
                return current.min(max);
            }
            self.send_window_notify.notified().await;
        }
    }

    fn consume_send(&self, taken: i32, n: i32) {
        let _ = self.send_window.compare_exchange(
            taken,
            (taken - n).max(0),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// A live TCP flow being bridged between the TUN device and an upstream
/// dialer.
pub struct TcpTracker {
    pub flow: FlowKey,
    input_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    destroyed: Arc<AtomicBool>,
}

impl TcpTracker {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn feed(&self, inbound: Inbound) {
        let _ = self.input_tx.send(inbound).await;
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the three tasks for a newly-SYN'd flow and returns its handle.
///
/// `initial_seq`/`initial_ack` are the sequence numbers established by the
/// opening SYN; `on_destroyed` is invoked (from the state task) once the
/// flow reaches a terminal state, so the engine can drop it from its map.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    flow: FlowKey,
    proxy: ProxyDescriptor,
    stream: BoxedStream,
    client_isn: u32,
    to_tun: mpsc::Sender<OutboundPacket>,
    on_destroyed: impl Fn(FlowKey) + Send + Sync + 'static,
) -> TcpTracker {
    let (input_tx, input_rx) = mpsc::channel(64);
    let (to_upstream_tx, to_upstream_rx) = mpsc::channel::<Vec<u8>>(256);
    let (from_upstream_tx, from_upstream_rx) = mpsc::channel::<Vec<u8>>(256);
    let (upstream_closed_tx, upstream_closed_rx) = tokio::sync::oneshot::channel::<()>();

    let cancel = CancellationToken::new();
    let destroyed = Arc::new(AtomicBool::new(false));
    let windows = Arc::new(Windows::new());

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // upstream writer task
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut rx = to_upstream_rx;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = rx.recv() => {
                        match chunk {
                            Some(data) => {
                                if write_half.write_all(&data).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    // upstream reader task
    {
        let cancel = cancel.clone();
        let windows = windows.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::buffer::MTU - 40];
            let mut closed_tx = Some(upstream_closed_tx);
            loop {
                let budget = windows.take_send_budget(buf.len() as i32).await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = read_half.read(&mut buf[..budget as usize]) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                windows.consume_send(budget, n as i32);
                                if from_upstream_tx.send(buf[..n].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            if let Some(tx) = closed_tx.take() {
                let _ = tx.send(());
            }
        });
    }

    // state machine task
    {
        let flow = flow;
        let to_tun = to_tun;
        let cancel_for_task = cancel.clone();
        let destroyed = destroyed.clone();
        tokio::spawn(run_state_machine(
            flow,
            proxy.kind,
            client_isn,
            input_rx,
            to_upstream_tx,
            from_upstream_rx,
            upstream_closed_rx,
            to_tun,
            windows,
            cancel_for_task,
            destroyed,
            on_destroyed,
        ));
    }

    TcpTracker {
        flow,
        input_tx,
        cancel,
        destroyed,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_state_machine(
    flow: FlowKey,
    proxy_kind: ProxyKind,
    client_isn: u32,
    mut input_rx: mpsc::Receiver<Inbound>,
    to_upstream: mpsc::Sender<Vec<u8>>,
    mut from_upstream: mpsc::Receiver<Vec<u8>>,
    mut upstream_closed: tokio::sync::oneshot::Receiver<()>,
    to_tun: mpsc::Sender<OutboundPacket>,
    windows: Arc<Windows>,
    cancel: CancellationToken,
    destroyed: Arc<AtomicBool>,
    on_destroyed: impl Fn(FlowKey) + Send + Sync + 'static,
) {
    let builder = SegmentBuilder { flow, ttl: 64 };
    let mut ip_id: u16 = 1;
    let mut state = TcpState::SynRcvd;
    let mut nxt_seq: u32 = 1; // SYN consumes seq 0 from the gateway's side
    let mut rcv_nxt_seq: u32 = client_isn.wrapping_add(1);
    let mut last_ack_sent: u32 = 0;
    let mut http_first_chunk_sent = false;

    // SYN/ACK for the opening handshake.
    let syn_ack = builder.syn_ack(next_id(&mut ip_id), 0, rcv_nxt_seq, MAX_WINDOW as u16);
    let _ = to_tun.send(OutboundPacket::Tcp(syn_ack)).await;

    let mut ack_timer = tokio::time::interval(ACK_DELAY);
    ack_timer.tick().await; // consume the immediate first tick

    let mut idle_deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = tokio::time::sleep_until(idle_deadline) => {
                debug!(%flow, "tcp flow idle timeout");
                break;
            }

            _ = ack_timer.tick(), if state == TcpState::Established => {
                if last_ack_sent < rcv_nxt_seq {
                    let ack = builder.ack(next_id(&mut ip_id), nxt_seq, rcv_nxt_seq, recv_window(&windows));
                    let _ = to_tun.send(OutboundPacket::Tcp(ack)).await;
                    last_ack_sent = rcv_nxt_seq;
                }
            }

            data = from_upstream.recv(), if state == TcpState::Established => {
                let Some(data) = data else { continue };
                let seg = builder.payload(next_id(&mut ip_id), nxt_seq, rcv_nxt_seq, recv_window(&windows), &data);
                nxt_seq = nxt_seq.wrapping_add(data.len() as u32);
                last_ack_sent = rcv_nxt_seq;
                let _ = to_tun.send(OutboundPacket::Tcp(seg)).await;
            }

            _ = &mut upstream_closed, if state == TcpState::Established => {
                let fin = builder.fin_ack(next_id(&mut ip_id), nxt_seq, rcv_nxt_seq, recv_window(&windows));
                nxt_seq = nxt_seq.wrapping_add(1);
                let _ = to_tun.send(OutboundPacket::Tcp(fin)).await;
                state = TcpState::FinWait1;
            }

            inbound = input_rx.recv() => {
                let Some(inbound) = inbound else { break };
                idle_deadline = tokio::time::Instant::now() + IDLE_TIMEOUT;
                windows.set_send(inbound.window as i32);

                let transition = match state {
                    TcpState::SynRcvd => state::on_syn_rcvd(&inbound.seg, rcv_nxt_seq, nxt_seq),
                    TcpState::Established => state::on_established(&inbound.seg, rcv_nxt_seq),
                    TcpState::FinWait1 => state::on_fin_wait_1(&inbound.seg, rcv_nxt_seq, nxt_seq),
                    TcpState::FinWait2 => state::on_fin_wait_2(&inbound.seg, rcv_nxt_seq, nxt_seq),
                    TcpState::Closing => state::on_closing(&inbound.seg, rcv_nxt_seq, nxt_seq),
                    TcpState::LastAck => state::on_last_ack(&inbound.seg, rcv_nxt_seq, nxt_seq),
                    TcpState::Closed | TcpState::TimeWait => break,
                };

                match transition.action {
                    Action::RelayPayload => {
                        rcv_nxt_seq = rcv_nxt_seq.wrapping_add(inbound.seg.payload_len);
                        windows.shrink_recv(inbound.seg.payload_len as i32);
                        let mut chunk = inbound.payload;
                        if let ProxyKind::HttpConnect { auth_header } = &proxy_kind {
                            if flow.remote_port == 80 && !http_first_chunk_sent {
                                let host = flow.remote_ip.to_string();
                                chunk = crate::dialer::http_connect::patch_plain_http_request(&chunk, &host, auth_header);
                                http_first_chunk_sent = true;
                            }
                        }
                        let sent = to_upstream.send(chunk).await.is_ok();
                        windows.grow_recv(inbound.seg.payload_len as i32);
                        if !sent {
                            break;
                        }
                    }
                    Action::SendAck => {
                        let ack = builder.ack(next_id(&mut ip_id), nxt_seq, rcv_nxt_seq, recv_window(&windows));
                        let _ = to_tun.send(OutboundPacket::Tcp(ack)).await;
                    }
                    Action::SendFinAck => {
                        rcv_nxt_seq = rcv_nxt_seq.wrapping_add(1);
                        let fin = builder.fin_ack(next_id(&mut ip_id), nxt_seq, rcv_nxt_seq, recv_window(&windows));
                        nxt_seq = nxt_seq.wrapping_add(1);
                        let _ = to_tun.send(OutboundPacket::Tcp(fin)).await;
                    }
                    Action::SendRst => {
                        let rst = SegmentBuilder::rst_for(flow, 64, next_id(&mut ip_id), inbound.seg.seq, inbound.seg.ack, inbound.seg.ack_flag, inbound.seg.payload_len);
                        let _ = to_tun.send(OutboundPacket::Tcp(rst)).await;
                    }
                    Action::Ignore => {}
                }

                trace!(%flow, from = ?state, to = ?transition.next_state, "tcp state transition");
                state = transition.next_state;
                if !transition.keep_alive {
                    if state == TcpState::TimeWait {
                        tokio::time::sleep(TIME_WAIT_DURATION).await;
                    }
                    break;
                }
            }
        }
    }

    destroyed.store(true, Ordering::SeqCst);
    cancel.cancel();
    on_destroyed(flow);
    debug!(%flow, "tcp tracker destroyed");
}

fn recv_window(windows: &Windows) -> u16 {
    windows.recv_window.load(Ordering::SeqCst).max(0) as u16
}

fn next_id(counter: &mut u16) -> u16 {
    let id = *counter;
    *counter = counter.wrapping_add(1);
    id
}

pub fn local_addr_ip(flow: &FlowKey) -> IpAddr {
    flow.local_ip
}
