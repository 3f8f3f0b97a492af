//! IPv4 header parsing and serialization.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::checksum::ones_complement_sum;
use super::CodecError;

/// A single IPv4 option as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ipv4Option {
    /// Option type 0: marks the end of the option list.
    EndOfList,
    /// Option type 1: one byte of alignment padding.
    NoOp,
    /// Any other option, carried opaquely.
    Other { option_type: u8, data: Vec<u8> },
}

impl Ipv4Option {
    fn wire_len(&self) -> usize {
        match self {
            Ipv4Option::EndOfList | Ipv4Option::NoOp => 1,
            Ipv4Option::Other { data, .. } => 2 + data.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ipv4Header {
    pub ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: std::net::Ipv4Addr,
    pub dst: std::net::Ipv4Addr,
    pub options: Vec<Ipv4Option>,
}

impl Ipv4Header {
    pub const MIN_LEN: usize = 20;

    /// `true` when more fragments follow (the MF bit).
    pub fn more_fragments(&self) -> bool {
        self.flags & 0x1 != 0
    }

    /// `true` when this is fragment 0 of an unfragmented (or first-fragment)
    /// datagram.
    pub fn is_first_fragment(&self) -> bool {
        self.fragment_offset == 0
    }

    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Serializes this header (options included, checksum recomputed) into
    /// `out`, which must be exactly [`Ipv4Header::header_len`] bytes.
    pub fn serialize(&self, out: &mut [u8]) {
        let hlen = self.header_len();
        assert_eq!(out.len(), hlen);
        out[0] = (4 << 4) | self.ihl;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        let flags_frag = ((self.flags as u16) << 13) | (self.fragment_offset & 0x1FFF);
        out[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());

        let mut cursor = 20;
        for opt in &self.options {
            match opt {
                Ipv4Option::EndOfList => {
                    out[cursor] = 0;
                    cursor += 1;
                }
                Ipv4Option::NoOp => {
                    out[cursor] = 1;
                    cursor += 1;
                }
                Ipv4Option::Other { option_type, data } => {
                    out[cursor] = *option_type;
                    out[cursor + 1] = (2 + data.len()) as u8;
                    out[cursor + 2..cursor + 2 + data.len()].copy_from_slice(data);
                    cursor += 2 + data.len();
                }
            }
        }
        while cursor < hlen {
            out[cursor] = 0;
            cursor += 1;
        }

        let sum = ones_complement_sum(out);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
    }

    /// Computes the header length (20 + padded options) an about-to-be-built
    /// header with these options would need, the way [`Self::serialize`]
    /// expects it — options padded up to a 32-bit boundary.
    pub fn header_len_for_options(options: &[Ipv4Option]) -> usize {
        let raw: usize = options.iter().map(Ipv4Option::wire_len).sum();
        let padded = raw.div_ceil(4) * 4;
        20 + padded
    }
}

fn take_bytes(input: &[u8], n: usize) -> IResult<&[u8], &[u8]> {
    take(n)(input)
}

pub fn parse(pkt: &[u8]) -> Result<(Ipv4Header, &[u8]), CodecError> {
    if pkt.len() < Ipv4Header::MIN_LEN {
        return Err(CodecError::Truncated {
            needed: Ipv4Header::MIN_LEN,
            available: pkt.len(),
        });
    }

    let version_ihl = pkt[0];
    let ihl = version_ihl & 0x0F;
    if ihl < 5 {
        return Err(CodecError::BadHeaderLength { ihl });
    }
    let header_len = ihl as usize * 4;
    if header_len > pkt.len() {
        return Err(CodecError::Truncated {
            needed: header_len,
            available: pkt.len(),
        });
    }

    let (rest, tos) = be_u8::<_, nom::error::Error<&[u8]>>(&pkt[1..])
        .map_err(|_| CodecError::Truncated { needed: 2, available: pkt.len() })?;
    let (rest, total_length) = be_u16::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 4, available: pkt.len() })?;
    let (rest, identification) = be_u16::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 6, available: pkt.len() })?;
    let (rest, flags_frag) = be_u16::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 8, available: pkt.len() })?;
    let (rest, ttl) = be_u8::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 9, available: pkt.len() })?;
    let (rest, protocol) = be_u8::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 10, available: pkt.len() })?;
    let (rest, checksum) = be_u16::<_, nom::error::Error<&[u8]>>(rest)
        .map_err(|_| CodecError::Truncated { needed: 12, available: pkt.len() })?;
    let (rest, src_bytes) = take_bytes(rest, 4)
        .map_err(|_| CodecError::Truncated { needed: 16, available: pkt.len() })?;
    let (_, dst_bytes) = take_bytes(rest, 4)
        .map_err(|_| CodecError::Truncated { needed: 20, available: pkt.len() })?;

    if (total_length as usize) < Ipv4Header::MIN_LEN {
        return Err(CodecError::BadHeaderLength { ihl });
    }
    if header_len > total_length as usize {
        return Err(CodecError::BadHeaderLength { ihl });
    }

    let options = parse_options(&pkt[20..header_len])?;

    let header = Ipv4Header {
        ihl,
        tos,
        total_length,
        identification,
        flags: (flags_frag >> 13) as u8,
        fragment_offset: flags_frag & 0x1FFF,
        ttl,
        protocol,
        checksum,
        src: std::net::Ipv4Addr::new(src_bytes[0], src_bytes[1], src_bytes[2], src_bytes[3]),
        dst: std::net::Ipv4Addr::new(dst_bytes[0], dst_bytes[1], dst_bytes[2], dst_bytes[3]),
        options,
    };

    let declared_end = total_length as usize;
    let available_end = declared_end.min(pkt.len());
    Ok((header, &pkt[header_len..available_end]))
}

fn parse_options(mut rest: &[u8]) -> Result<Vec<Ipv4Option>, CodecError> {
    let mut options = Vec::new();
    let total_len = rest.len();
    while !rest.is_empty() {
        let offset = 20 + (total_len - rest.len());
        let option_type = rest[0];
        match option_type {
            0 => {
                options.push(Ipv4Option::EndOfList);
                break;
            }
            1 => {
                options.push(Ipv4Option::NoOp);
                rest = &rest[1..];
            }
            _ => {
                if rest.len() < 2 {
                    return Err(CodecError::BadOption { offset });
                }
                let len = rest[1] as usize;
                if len < 2 || len > rest.len() {
                    return Err(CodecError::BadOption { offset });
                }
                options.push(Ipv4Option::Other {
                    option_type,
                    data: rest[2..len].to_vec(),
                });
                rest = &rest[len..];
            }
        }
    }
    Ok(options)
}

/// Splits `payload` into a sequence of IPv4 fragment headers for datagrams
/// too large to send whole, each carrying at most `MTU - 20` bytes.
///
/// `template` supplies identification/ttl/protocol/src/dst; its own flags
/// and fragment_offset are ignored. The last fragment has MF cleared.
pub fn fragment_payload(template: &Ipv4Header, mtu: usize, payload: &[u8]) -> Vec<(Ipv4Header, Vec<u8>)> {
    let chunk_size = mtu - 20;
    let mut fragments = Vec::new();
    let mut offset_words: u16 = 0;
    let mut remaining = payload;
    loop {
        let (chunk, rest, more) = if remaining.len() <= chunk_size {
            (remaining, &remaining[remaining.len()..], false)
        } else {
            (&remaining[..chunk_size], &remaining[chunk_size..], true)
        };
        let header = Ipv4Header {
            ihl: 5,
            tos: 0,
            total_length: 0,
            identification: template.identification,
            flags: if more { 1 } else { 0 },
            fragment_offset: offset_words,
            ttl: template.ttl,
            protocol: template.protocol,
            checksum: 0,
            src: template.src,
            dst: template.dst,
            options: vec![],
        };
        fragments.push((header, chunk.to_vec()));
        if !more {
            break;
        }
        offset_words += (chunk_size / 8) as u16;
        remaining = rest;
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ihl: u8, total_length: u16) -> Vec<u8> {
        let mut buf = vec![0u8; total_length as usize];
        buf[0] = (4 << 4) | ihl;
        buf[2..4].copy_from_slice(&total_length.to_be_bytes());
        buf[8] = 64;
        buf[9] = 6;
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
        buf
    }

    #[test]
    fn parses_minimal_header() {
        let buf = sample(5, 20);
        let (hdr, payload) = parse(&buf).unwrap();
        assert_eq!(hdr.header_len(), 20);
        assert!(payload.is_empty());
        assert_eq!(hdr.src, std::net::Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let err = parse(&[0x45, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn rejects_ihl_below_five() {
        let mut buf = sample(5, 20);
        buf[0] = (4 << 4) | 4;
        let err = parse(&buf).unwrap_err();
        assert!(matches!(err, CodecError::BadHeaderLength { ihl: 4 }));
    }

    #[test]
    fn walks_options_to_end_of_list() {
        let mut buf = sample(6, 24);
        buf[20] = 1; // NOP
        buf[21] = 0; // EOOL
        let (hdr, _) = parse(&buf).unwrap();
        assert_eq!(
            hdr.options,
            vec![Ipv4Option::NoOp, Ipv4Option::EndOfList]
        );
    }

    #[test]
    fn fragments_split_on_eight_byte_boundaries() {
        let template = Ipv4Header {
            ihl: 5,
            tos: 0,
            total_length: 0,
            identification: 99,
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            protocol: 17,
            checksum: 0,
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            options: vec![],
        };
        let payload = vec![0xAB; 30_000];
        let frags = fragment_payload(&template, 10_240, &payload);
        assert!(frags.len() > 1);
        let last = frags.last().unwrap();
        assert_eq!(last.0.flags, 0);
        assert!(frags[..frags.len() - 1].iter().all(|(h, _)| h.flags == 1));
        let total: usize = frags.iter().map(|(_, c)| c.len()).sum();
        assert_eq!(total, payload.len());
    }

    #[test]
    fn round_trips_serialize_checksum() {
        let buf = sample(5, 20);
        let (hdr, _) = parse(&buf).unwrap();
        let mut out = vec![0u8; hdr.header_len()];
        hdr.serialize(&mut out);
        assert_eq!(ones_complement_sum(&out), 0);
    }
}
