//! The simplified server-side TCP state machine.
//!
//! Ten states, driven purely by sequence/ack validity and the incoming
//! segment's flags — no congestion control, no SACK, no PAWS. This module
//! is intentionally free of I/O and async so the transition table can be
//! tested as plain data in, data out.

use std::time::Duration;

/// Server-side TCP states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
}

/// The idle timeout before a stalled flow (no traffic in either direction)
/// is torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Coalescing window before a pending ACK-with-no-data is flushed.
pub const ACK_DELAY: Duration = Duration::from_millis(10);
/// How long a flow lingers in TIME_WAIT before being destroyed.
pub const TIME_WAIT_DURATION: Duration = Duration::from_millis(500);

/// The relevant subset of an incoming segment's header, decoupled from the
/// wire representation so the state table can be unit tested directly.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload_len: u32,
}

/// What the engine should do in response to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Relay the segment's payload upstream (only meaningful with a
    /// non-zero payload).
    RelayPayload,
    /// Reply with a plain ACK (out-of-order arrival, nothing relayed).
    SendAck,
    /// Reply with a FIN/ACK and move toward close.
    SendFinAck,
    /// Reply with a RST — either because the peer sent one we must answer,
    /// or because the segment was invalid enough to warrant it.
    SendRst,
    /// Do nothing with this segment beyond possibly updating state.
    Ignore,
}

/// Outcome of feeding one segment to the state machine in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next_state: TcpState,
    pub action: Action,
    /// `false` once the flow should be torn down (peer RST, final ACK of
    /// the close sequence, or an invalid segment in a state where the
    /// original implementation treats that as fatal).
    pub keep_alive: bool,
}

fn valid_seq(seg: &Segment, rcv_nxt: u32) -> bool {
    seg.seq == rcv_nxt
}

fn valid_ack(seg: &Segment, nxt_seq: u32) -> bool {
    seg.ack == nxt_seq
}

/// `SYN_RCVD`: expects an ACK with the matching ack number before moving to
/// `ESTABLISHED`.
pub fn on_syn_rcvd(seg: &Segment, rcv_nxt: u32, nxt_seq: u32) -> Transition {
    if !(valid_seq(seg, rcv_nxt) && valid_ack(seg, nxt_seq)) {
        return if seg.rst {
            Transition { next_state: TcpState::SynRcvd, action: Action::Ignore, keep_alive: true }
        } else {
            Transition { next_state: TcpState::SynRcvd, action: Action::SendRst, keep_alive: true }
        };
    }
    if seg.rst {
        return Transition { next_state: TcpState::Closed, action: Action::Ignore, keep_alive: false };
    }
    if !seg.ack_flag {
        return Transition { next_state: TcpState::SynRcvd, action: Action::Ignore, keep_alive: true };
    }
    let action = if seg.payload_len != 0 {
        Action::RelayPayload
    } else {
        Action::Ignore
    };
    Transition { next_state: TcpState::Established, action, keep_alive: true }
}

/// `ESTABLISHED`: the steady state — relay payload, ack out-of-order
/// arrivals, and start closing on FIN.
pub fn on_established(seg: &Segment, rcv_nxt: u32) -> Transition {
    if !valid_seq(seg, rcv_nxt) {
        return Transition { next_state: TcpState::Established, action: Action::SendAck, keep_alive: true };
    }
    if seg.rst {
        return Transition { next_state: TcpState::Closed, action: Action::Ignore, keep_alive: false };
    }
    if !seg.ack_flag {
        return Transition { next_state: TcpState::Established, action: Action::Ignore, keep_alive: true };
    }
    if seg.fin {
        return Transition { next_state: TcpState::LastAck, action: Action::SendFinAck, keep_alive: true };
    }
    let action = if seg.payload_len != 0 {
        Action::RelayPayload
    } else {
        Action::Ignore
    };
    Transition { next_state: TcpState::Established, action, keep_alive: true }
}

/// `FIN_WAIT_1`: we've sent our own FIN and are waiting for it to be acked
/// and/or the peer's FIN.
pub fn on_fin_wait_1(seg: &Segment, rcv_nxt: u32, nxt_seq: u32) -> Transition {
    if !valid_seq(seg, rcv_nxt) || seg.rst || !seg.ack_flag {
        let next_state = if seg.rst || !valid_seq(seg, rcv_nxt) || !seg.ack_flag {
            TcpState::Closed
        } else {
            TcpState::FinWait1
        };
        return Transition { next_state, action: Action::Ignore, keep_alive: false };
    }
    if seg.fin {
        let (next_state, keep_alive) = if valid_ack(seg, nxt_seq) {
            (TcpState::TimeWait, false)
        } else {
            (TcpState::Closing, true)
        };
        Transition { next_state, action: Action::SendAck, keep_alive }
    } else {
        Transition { next_state: TcpState::FinWait2, action: Action::Ignore, keep_alive: true }
    }
}

/// `FIN_WAIT_2`: our FIN was acked; waiting on the peer's FIN.
pub fn on_fin_wait_2(seg: &Segment, rcv_nxt: u32, nxt_seq: u32) -> Transition {
    if !(valid_seq(seg, rcv_nxt) && valid_ack(seg, nxt_seq)) || seg.rst || !seg.ack_flag || !seg.fin {
        return Transition { next_state: TcpState::FinWait2, action: Action::Ignore, keep_alive: false };
    }
    Transition { next_state: TcpState::TimeWait, action: Action::SendAck, keep_alive: false }
}

/// `CLOSING`: simultaneous close — both sides sent FIN before seeing the
/// other's.
pub fn on_closing(seg: &Segment, rcv_nxt: u32, nxt_seq: u32) -> Transition {
    if !(valid_seq(seg, rcv_nxt) && valid_ack(seg, nxt_seq)) {
        return Transition { next_state: TcpState::Closing, action: Action::Ignore, keep_alive: true };
    }
    if seg.rst {
        return Transition { next_state: TcpState::Closed, action: Action::Ignore, keep_alive: false };
    }
    if !seg.ack_flag {
        return Transition { next_state: TcpState::Closing, action: Action::Ignore, keep_alive: true };
    }
    Transition { next_state: TcpState::TimeWait, action: Action::Ignore, keep_alive: false }
}

/// `LAST_ACK`: we (the server) initiated close; waiting for the final ACK
/// of our FIN.
pub fn on_last_ack(seg: &Segment, rcv_nxt: u32, nxt_seq: u32) -> Transition {
    if !(valid_seq(seg, rcv_nxt) && valid_ack(seg, nxt_seq)) || !seg.ack_flag {
        return Transition { next_state: TcpState::LastAck, action: Action::Ignore, keep_alive: true };
    }
    Transition { next_state: TcpState::Closed, action: Action::Ignore, keep_alive: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(seq: u32, ack: u32, flags: (bool, bool, bool, bool), payload_len: u32) -> Segment {
        let (syn, ack_flag, fin, rst) = flags;
        Segment { seq, ack, syn, ack_flag, fin, rst, payload_len }
    }

    #[test]
    fn syn_rcvd_moves_to_established_on_valid_ack() {
        let t = on_syn_rcvd(&seg(1, 1, (false, true, false, false), 0), 1, 1);
        assert_eq!(t.next_state, TcpState::Established);
        assert!(t.keep_alive);
    }

    #[test]
    fn syn_rcvd_rst_on_invalid_seq_ack() {
        let t = on_syn_rcvd(&seg(5, 5, (false, true, false, false), 0), 1, 1);
        assert_eq!(t.action, Action::SendRst);
        assert_eq!(t.next_state, TcpState::SynRcvd);
    }

    #[test]
    fn established_acks_out_of_order_segment() {
        let t = on_established(&seg(99, 1, (false, true, false, false), 0), 1);
        assert_eq!(t.action, Action::SendAck);
        assert_eq!(t.next_state, TcpState::Established);
    }

    #[test]
    fn established_relays_payload() {
        let t = on_established(&seg(1, 1, (false, true, false, false), 5), 1);
        assert_eq!(t.action, Action::RelayPayload);
    }

    #[test]
    fn established_fin_moves_to_last_ack() {
        let t = on_established(&seg(1, 1, (false, true, true, false), 0), 1);
        assert_eq!(t.next_state, TcpState::LastAck);
        assert_eq!(t.action, Action::SendFinAck);
    }

    #[test]
    fn established_rst_tears_down() {
        let t = on_established(&seg(1, 1, (false, false, false, true), 0), 1);
        assert!(!t.keep_alive);
    }

    #[test]
    fn fin_wait_1_to_time_wait_on_fin_with_valid_ack() {
        let t = on_fin_wait_1(&seg(1, 10, (false, true, true, false), 0), 1, 10);
        assert_eq!(t.next_state, TcpState::TimeWait);
    }

    #[test]
    fn fin_wait_1_to_fin_wait_2_without_fin() {
        let t = on_fin_wait_1(&seg(1, 10, (false, true, false, false), 0), 1, 10);
        assert_eq!(t.next_state, TcpState::FinWait2);
        assert!(t.keep_alive, "FIN_WAIT_2 must stay alive to receive the peer's later FIN");
    }

    #[test]
    fn fin_wait_1_simultaneous_close_moves_to_closing_alive() {
        let t = on_fin_wait_1(&seg(1, 10, (false, true, true, false), 0), 1, 999);
        assert_eq!(t.next_state, TcpState::Closing);
        assert!(t.keep_alive, "CLOSING must stay alive to receive the final ACK");
    }

    #[test]
    fn last_ack_closes_on_valid_final_ack() {
        let t = on_last_ack(&seg(1, 10, (false, true, false, false), 0), 1, 10);
        assert_eq!(t.next_state, TcpState::Closed);
        assert!(!t.keep_alive);
    }
}
