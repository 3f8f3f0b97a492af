//! TCP header parsing and serialization, including the subset of options
//! this gateway cares about.

use super::checksum::checksum_with_pseudo_header;
use super::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        TcpFlags {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
            urg: b & 0x20 != 0,
        }
    }

    fn to_byte(self) -> u8 {
        (self.fin as u8)
            | (self.syn as u8) << 1
            | (self.rst as u8) << 2
            | (self.psh as u8) << 3
            | (self.ack as u8) << 4
            | (self.urg as u8) << 5
    }
}

/// The TCP options this gateway parses or emits. Anything else observed on
/// the wire is dropped rather than carried opaquely — the server-side state
/// machine this feeds never needs SACK/timestamp option round-tripping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: TcpOptions,
}

impl TcpHeader {
    pub const MIN_LEN: usize = 20;

    pub fn header_len(&self) -> usize {
        self.data_offset as usize * 4
    }

    /// Serializes this header into `out` (exactly `header_len()` bytes),
    /// computes the checksum over `pseudo_header ++ header ++ payload`, and
    /// writes it into the checksum field.
    pub fn serialize(&self, out: &mut [u8], pseudo_header: &[u8], payload: &[u8]) {
        let hlen = self.header_len();
        assert_eq!(out.len(), hlen);
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = (self.data_offset << 4) | 0;
        out[13] = self.flags.to_byte();
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&[0, 0]);
        out[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        let mut cursor = 20;
        if let Some(mss) = self.options.mss {
            out[cursor] = 2;
            out[cursor + 1] = 4;
            out[cursor + 2..cursor + 4].copy_from_slice(&mss.to_be_bytes());
            cursor += 4;
        }
        while cursor < hlen {
            out[cursor] = 0;
            cursor += 1;
        }

        let checksum = checksum_with_pseudo_header(pseudo_header, &[out, payload].concat());
        out[16..18].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Header length this header will serialize to, given its current
    /// options (20 bytes base + 4 for MSS if present, 32-bit aligned).
    pub fn header_len_for_options(options: &TcpOptions) -> usize {
        let raw = 20 + if options.mss.is_some() { 4 } else { 0 };
        raw.div_ceil(4) * 4
    }
}

pub fn parse(pkt: &[u8]) -> Result<(TcpHeader, &[u8]), CodecError> {
    if pkt.len() < TcpHeader::MIN_LEN {
        return Err(CodecError::Truncated {
            needed: TcpHeader::MIN_LEN,
            available: pkt.len(),
        });
    }
    let src_port = u16::from_be_bytes([pkt[0], pkt[1]]);
    let dst_port = u16::from_be_bytes([pkt[2], pkt[3]]);
    let seq = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
    let ack = u32::from_be_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]);
    let data_offset = pkt[12] >> 4;
    let flags = TcpFlags::from_byte(pkt[13]);
    let window = u16::from_be_bytes([pkt[14], pkt[15]]);
    let checksum = u16::from_be_bytes([pkt[16], pkt[17]]);
    let urgent_pointer = u16::from_be_bytes([pkt[18], pkt[19]]);

    if data_offset < 5 {
        return Err(CodecError::BadHeaderLength { ihl: data_offset });
    }
    let header_len = data_offset as usize * 4;
    if header_len > pkt.len() {
        return Err(CodecError::Truncated {
            needed: header_len,
            available: pkt.len(),
        });
    }

    let options = parse_options(&pkt[20..header_len])?;

    let header = TcpHeader {
        src_port,
        dst_port,
        seq,
        ack,
        data_offset,
        flags,
        window,
        checksum,
        urgent_pointer,
        options,
    };
    Ok((header, &pkt[header_len..]))
}

fn parse_options(mut rest: &[u8]) -> Result<TcpOptions, CodecError> {
    let total_len = rest.len();
    let mut options = TcpOptions::default();
    while !rest.is_empty() {
        let offset = 20 + (total_len - rest.len());
        match rest[0] {
            0 => break, // end of option list
            1 => rest = &rest[1..], // NOP
            2 => {
                if rest.len() < 4 || rest[1] != 4 {
                    return Err(CodecError::BadOption { offset });
                }
                options.mss = Some(u16::from_be_bytes([rest[2], rest[3]]));
                rest = &rest[4..];
            }
            3 => {
                if rest.len() < 3 || rest[1] != 3 {
                    return Err(CodecError::BadOption { offset });
                }
                options.window_scale = Some(rest[2]);
                rest = &rest[3..];
            }
            _ => {
                if rest.len() < 2 {
                    return Err(CodecError::BadOption { offset });
                }
                let len = rest[1] as usize;
                if len < 2 || len > rest.len() {
                    return Err(CodecError::BadOption { offset });
                }
                rest = &rest[len..];
            }
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with_options(opt_bytes: &[u8]) -> Vec<u8> {
        let padded_len = (opt_bytes.len()).div_ceil(4) * 4;
        let data_offset = 5 + padded_len / 4;
        let mut buf = vec![0u8; data_offset * 4];
        buf[12] = (data_offset as u8) << 4;
        buf[14..16].copy_from_slice(&65535u16.to_be_bytes());
        buf[20..20 + opt_bytes.len()].copy_from_slice(opt_bytes);
        buf
    }

    #[test]
    fn parses_mss_option() {
        let buf = sample_with_options(&[2, 4, 0x05, 0xB4]);
        let (hdr, _) = parse(&buf).unwrap();
        assert_eq!(hdr.options.mss, Some(1460));
    }

    #[test]
    fn parses_window_scale_option() {
        let buf = sample_with_options(&[3, 3, 7, 1]); // + 1 NOP pad
        let (hdr, _) = parse(&buf).unwrap();
        assert_eq!(hdr.options.window_scale, Some(7));
    }

    #[test]
    fn rejects_truncated_header() {
        let err = parse(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn emits_mss_as_kind_2_len_4() {
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 0,
            data_offset: 6,
            flags: TcpFlags::from_byte(0x02),
            window: 65535,
            checksum: 0,
            urgent_pointer: 0,
            options: TcpOptions {
                mss: Some(1460),
                window_scale: None,
            },
        };
        let mut out = vec![0u8; 24];
        let pseudo = super::super::checksum::ipv4_pseudo_header(
            "0.0.0.0".parse().unwrap(),
            "0.0.0.0".parse().unwrap(),
            6,
            24,
        );
        header.serialize(&mut out, &pseudo, &[]);
        assert_eq!(&out[20..24], &[2, 4, 0x05, 0xB4]);
    }
}
