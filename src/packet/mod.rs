//! Bounds-checked codec for the IPv4/IPv6/TCP/UDP headers this gateway
//! needs to read and rewrite.
//!
//! Parsing is hand-written with [`nom`]'s combinators rather than
//! `nom_derive`'s `#[derive(Nom)]`: several fields here (the version/IHL
//! nibble pair, the 3-bit flags + 13-bit fragment-offset pair, IPv4 options
//! that must stop at the header's own declared length) carry cross-field
//! validation the derive macro doesn't model well.

pub mod checksum;
pub mod ipv4;
pub mod ipv6;
pub mod tcp;
pub mod udp;

use std::fmt;

pub use ipv4::{fragment_payload, Ipv4Header};
pub use ipv6::Ipv6Header;
pub use tcp::TcpHeader;
pub use udp::UdpHeader;

/// IP protocol numbers this gateway understands on top of IPv4/IPv6.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// A parse or validation failure in the packet codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes were available than the header declared it needed.
    Truncated { needed: usize, available: usize },
    /// IHL (or IPv6 payload length) didn't agree with the buffer/overall length.
    BadHeaderLength { ihl: u8 },
    /// An IPv4 option ran past the header's own declared end.
    BadOption { offset: usize },
    /// The IP version nibble was neither 4 nor 6.
    UnsupportedIpVersion(u8),
    /// An IPv6 extension header was present; this gateway only parses the
    /// fixed 40-byte base header.
    UnsupportedIpv6ExtensionHeader(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, available } => write!(
                f,
                "truncated packet: needed {needed} bytes, had {available}"
            ),
            CodecError::BadHeaderLength { ihl } => {
                write!(f, "invalid header length (IHL={ihl})")
            }
            CodecError::BadOption { offset } => {
                write!(f, "malformed option at byte offset {offset}")
            }
            CodecError::UnsupportedIpVersion(v) => write!(f, "unsupported IP version {v}"),
            CodecError::UnsupportedIpv6ExtensionHeader(next) => write!(
                f,
                "unsupported IPv6 extension header (next-header {next})"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

/// Either parsed IP header kind, with its payload slice.
#[derive(Debug, Clone)]
pub enum IpHeader {
    V4(Ipv4Header),
    V6(Ipv6Header),
}

impl IpHeader {
    pub fn version(&self) -> u8 {
        match self {
            IpHeader::V4(_) => 4,
            IpHeader::V6(_) => 6,
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            IpHeader::V4(h) => h.protocol,
            IpHeader::V6(h) => h.next_header,
        }
    }

    pub fn src(&self) -> std::net::IpAddr {
        match self {
            IpHeader::V4(h) => std::net::IpAddr::V4(h.src),
            IpHeader::V6(h) => std::net::IpAddr::V6(h.src),
        }
    }

    pub fn dst(&self) -> std::net::IpAddr {
        match self {
            IpHeader::V4(h) => std::net::IpAddr::V4(h.dst),
            IpHeader::V6(h) => std::net::IpAddr::V6(h.dst),
        }
    }

    /// Length of the serialized header, in bytes, including options.
    pub fn header_len(&self) -> usize {
        match self {
            IpHeader::V4(h) => h.header_len(),
            IpHeader::V6(_) => 40,
        }
    }
}

/// Parses the IP version nibble and dispatches to the v4/v6 parser.
///
/// Returns the parsed header plus the remaining bytes (the IP payload —
/// everything after the IP header).
pub fn parse_ip(pkt: &[u8]) -> Result<(IpHeader, &[u8]), CodecError> {
    if pkt.is_empty() {
        return Err(CodecError::Truncated {
            needed: 1,
            available: 0,
        });
    }
    match pkt[0] >> 4 {
        4 => {
            let (hdr, rest) = ipv4::parse(pkt)?;
            Ok((IpHeader::V4(hdr), rest))
        }
        6 => {
            let (hdr, rest) = ipv6::parse(pkt)?;
            Ok((IpHeader::V6(hdr), rest))
        }
        other => Err(CodecError::UnsupportedIpVersion(other)),
    }
}
