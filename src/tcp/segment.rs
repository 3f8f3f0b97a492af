//! Builds outbound TCP segments (SYN/ACK, FIN/ACK, ACK, data, RST) as
//! complete wire-ready IP+TCP byte buffers.

use std::net::IpAddr;

use crate::packet::checksum::{ipv4_pseudo_header, ipv6_pseudo_header};
use crate::packet::tcp::{TcpFlags, TcpHeader, TcpOptions};
use crate::packet::{ipv4::Ipv4Header, ipv6::Ipv6Header};

/// The 5-tuple identifying a TCP flow, from the gateway's perspective
/// (`local` is the TUN-side peer, `remote` is the flow's destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// Parameters needed to build any outbound segment in this flow's
/// direction (remote -> local, i.e. gateway synthesizing a reply).
pub struct SegmentBuilder {
    pub flow: FlowKey,
    pub ttl: u8,
}

fn ip_pseudo_and_serialize(
    flow: &FlowKey,
    ttl: u8,
    ip_id: u16,
    tcp_len: usize,
) -> (Vec<u8>, Vec<u8>, usize) {
    // returns (pseudo_header, ip_header_bytes, ip_header_len)
    match (flow.remote_ip, flow.local_ip) {
        (IpAddr::V4(remote), IpAddr::V4(local)) => {
            let pseudo = ipv4_pseudo_header(remote, local, 6, tcp_len as u16).to_vec();
            let hdr = Ipv4Header {
                ihl: 5,
                tos: 0,
                total_length: 0,
                identification: ip_id,
                flags: 0,
                fragment_offset: 0,
                ttl,
                protocol: 6,
                checksum: 0,
                src: remote,
                dst: local,
                options: vec![],
            };
            let mut buf = vec![0u8; hdr.header_len()];
            // total_length filled in by caller after tcp_len known
            let mut hdr = hdr;
            hdr.total_length = (hdr.header_len() + tcp_len) as u16;
            hdr.serialize(&mut buf);
            let len = buf.len();
            (pseudo, buf, len)
        }
        (IpAddr::V6(remote), IpAddr::V6(local)) => {
            let pseudo = ipv6_pseudo_header(remote, local, 6, tcp_len as u32).to_vec();
            let hdr = Ipv6Header {
                traffic_class: 0,
                flow_label: 0,
                payload_length: tcp_len as u16,
                next_header: 6,
                hop_limit: ttl,
                src: remote,
                dst: local,
            };
            let mut buf = vec![0u8; Ipv6Header::LEN];
            hdr.serialize(&mut buf);
            let len = buf.len();
            (pseudo, buf, len)
        }
        _ => unreachable!("flow endpoints must share an IP version"),
    }
}

#[allow(clippy::too_many_arguments)]
fn build(
    flow: &FlowKey,
    ttl: u8,
    ip_id: u16,
    seq: u32,
    ack: u32,
    window: u16,
    flags: TcpFlags,
    options: TcpOptions,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_hdr = TcpHeader {
        src_port: flow.remote_port,
        dst_port: flow.local_port,
        seq,
        ack,
        data_offset: (TcpHeader::header_len_for_options(&options) / 4) as u8,
        flags,
        window,
        checksum: 0,
        urgent_pointer: 0,
        options,
    };
    let tcp_len = tcp_hdr.header_len() + payload.len();
    let (pseudo, ip_bytes, ip_len) = ip_pseudo_and_serialize(flow, ttl, ip_id, tcp_len);

    let mut tcp_bytes = vec![0u8; tcp_hdr.header_len()];
    tcp_hdr.serialize(&mut tcp_bytes, &pseudo, payload);

    let mut wire = Vec::with_capacity(ip_len + tcp_bytes.len() + payload.len());
    wire.extend_from_slice(&ip_bytes);
    wire.extend_from_slice(&tcp_bytes);
    wire.extend_from_slice(payload);
    wire
}

impl SegmentBuilder {
    pub fn syn_ack(&self, ip_id: u16, seq: u32, ack: u32, window: u16) -> Vec<u8> {
        build(
            &self.flow,
            self.ttl,
            ip_id,
            seq,
            ack,
            window,
            TcpFlags {
                fin: false,
                syn: true,
                rst: false,
                psh: false,
                ack: true,
                urg: false,
            },
            TcpOptions {
                mss: Some(1460),
                window_scale: None,
            },
            &[],
        )
    }

    pub fn fin_ack(&self, ip_id: u16, seq: u32, ack: u32, window: u16) -> Vec<u8> {
        build(
            &self.flow,
            self.ttl,
            ip_id,
            seq,
            ack,
            window,
            TcpFlags {
                fin: true,
                syn: false,
                rst: false,
                psh: false,
                ack: true,
                urg: false,
            },
            TcpOptions::default(),
            &[],
        )
    }

    pub fn ack(&self, ip_id: u16, seq: u32, ack: u32, window: u16) -> Vec<u8> {
        build(
            &self.flow,
            self.ttl,
            ip_id,
            seq,
            ack,
            window,
            TcpFlags {
                fin: false,
                syn: false,
                rst: false,
                psh: false,
                ack: true,
                urg: false,
            },
            TcpOptions::default(),
            &[],
        )
    }

    pub fn payload(&self, ip_id: u16, seq: u32, ack: u32, window: u16, data: &[u8]) -> Vec<u8> {
        build(
            &self.flow,
            self.ttl,
            ip_id,
            seq,
            ack,
            window,
            TcpFlags {
                fin: false,
                syn: false,
                rst: false,
                psh: true,
                ack: true,
                urg: false,
            },
            TcpOptions::default(),
            data,
        )
    }

    /// Builds a RST per RFC 793 3.4: if the triggering segment carried an
    /// ACK, the RST's sequence number is that ACK value; otherwise seq is 0
    /// and ack is the triggering segment's `seq + payload_len` (bumped by
    /// one if that would equal seq, matching a SYN-only trigger).
    pub fn rst_for(
        flow: FlowKey,
        ttl: u8,
        ip_id: u16,
        trigger_seq: u32,
        trigger_ack: u32,
        trigger_had_ack: bool,
        trigger_payload_len: u32,
    ) -> Vec<u8> {
        let mut seq = 0u32;
        let mut ack = trigger_seq.wrapping_add(trigger_payload_len);
        if ack == trigger_seq {
            ack = ack.wrapping_add(1);
        }
        if trigger_had_ack {
            seq = trigger_ack;
        }
        build(
            &flow,
            ttl,
            ip_id,
            seq,
            ack,
            65535,
            TcpFlags {
                fin: false,
                syn: false,
                rst: true,
                psh: false,
                ack: true,
                urg: false,
            },
            TcpOptions::default(),
            &[],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowKey {
        FlowKey {
            local_ip: "10.0.0.5".parse().unwrap(),
            local_port: 54321,
            remote_ip: "93.184.216.34".parse().unwrap(),
            remote_port: 443,
        }
    }

    #[test]
    fn syn_ack_emits_mss_option() {
        let builder = SegmentBuilder { flow: flow(), ttl: 64 };
        let wire = builder.syn_ack(1, 0, 100, 65535);
        let ip_hdr_len = 20;
        assert_eq!(&wire[ip_hdr_len + 20..ip_hdr_len + 24], &[2, 4, 0x05, 0xB4]);
    }

    #[test]
    fn rst_ack_field_is_seq_plus_payload_len() {
        let wire = SegmentBuilder::rst_for(flow(), 64, 1, 1000, 0, false, 5);
        // ack should be 1005 (seq + payload_len); decode from TCP header
        let tcp_ack = u32::from_be_bytes([wire[20 + 8], wire[20 + 9], wire[20 + 10], wire[20 + 11]]);
        assert_eq!(tcp_ack, 1005);
    }

    #[test]
    fn rst_with_ack_uses_ack_as_seq() {
        let wire = SegmentBuilder::rst_for(flow(), 64, 1, 1000, 55, true, 0);
        let tcp_seq = u32::from_be_bytes([wire[20 + 4], wire[20 + 5], wire[20 + 6], wire[20 + 7]]);
        assert_eq!(tcp_seq, 55);
    }
}
