//! Per-flow UID resolution.
//!
//! A host-supplied callback takes priority; otherwise this falls back to
//! parsing `/proc/net/tcp`/`/proc/net/tcp6`, matching the exact byte-order
//! conventions the kernel uses there (little-endian hex dwords for IPv4;
//! 32-bit-word-reversed nibble groups for IPv6).

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

/// Resolved application UID for a flow, or the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uid {
    Known(u32),
    Unknown,
}

impl Uid {
    pub fn as_i64(self) -> i64 {
        match self {
            Uid::Known(u) => u as i64,
            Uid::Unknown => -1,
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uid::Known(u) => write!(f, "{u}"),
            Uid::Unknown => write!(f, "-1"),
        }
    }
}

/// A host-supplied UID lookup, matching the embedder API's
/// `set_uid_callback`.
pub type UidCallback = Arc<dyn Fn(IpAddr, u16, IpAddr, u16) -> Uid + Send + Sync>;

/// Resolves the UID that owns a (local, remote) socket pair.
pub struct UidResolver {
    callback: Option<UidCallback>,
}

impl UidResolver {
    pub fn new(callback: Option<UidCallback>) -> Self {
        UidResolver { callback }
    }

    pub fn resolve(&self, local: IpAddr, local_port: u16, remote: IpAddr, remote_port: u16) -> Uid {
        if let Some(cb) = &self.callback {
            return cb(local, local_port, remote, remote_port);
        }
        proc_net_lookup(local, local_port, remote, remote_port)
    }
}

fn proc_net_lookup(local: IpAddr, local_port: u16, remote: IpAddr, remote_port: u16) -> Uid {
    let is_v6 = remote.is_ipv6();
    let path = if is_v6 { "/proc/net/tcp6" } else { "/proc/net/tcp" };
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) => {
            debug!(%path, error = %e, "could not read proc net table");
            return Uid::Unknown;
        }
    };

    for line in data.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let Some((src_ip, src_port)) = parse_hex_sockaddr(fields[1]) else {
            continue;
        };
        let Some((dst_ip, dst_port)) = parse_hex_sockaddr(fields[2]) else {
            continue;
        };
        if src_port == local_port
            && dst_port == remote_port
            && src_ip == local
            && dst_ip == remote
        {
            if let Ok(uid) = fields[7].parse::<u32>() {
                return Uid::Known(uid);
            }
        }
    }
    Uid::Unknown
}

/// Parses a `/proc/net/tcp{,6}` `HHHHHHHH:PPPP`-style field into an
/// `(IpAddr, port)` pair.
fn parse_hex_sockaddr(field: &str) -> Option<(IpAddr, u16)> {
    let (ip_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = if ip_hex.len() == 8 {
        IpAddr::V4(parse_ipv4_hex(ip_hex)?)
    } else if ip_hex.len() == 32 {
        IpAddr::V6(parse_ipv6_hex(ip_hex)?)
    } else {
        return None;
    };
    Some((ip, port))
}

/// `/proc/net/tcp`'s address field is a little-endian 32-bit word: the
/// octets must be read back to front, byte-pair by byte-pair.
fn parse_ipv4_hex(hex: &str) -> Option<std::net::Ipv4Addr> {
    let bytes = hex_bytes(hex)?;
    Some(std::net::Ipv4Addr::new(bytes[3], bytes[2], bytes[1], bytes[0]))
}

/// `/proc/net/tcp6`'s address field is four little-endian 32-bit words in
/// wire order; each 4-byte word's bytes are reversed independently.
fn parse_ipv6_hex(hex: &str) -> Option<std::net::Ipv6Addr> {
    let bytes = hex_bytes(hex)?;
    if bytes.len() != 16 {
        return None;
    }
    let mut out = [0u8; 16];
    for word in 0..4 {
        let base = word * 4;
        out[base] = bytes[base + 3];
        out[base + 1] = bytes[base + 2];
        out[base + 2] = bytes[base + 1];
        out[base + 3] = bytes[base];
    }
    Some(std::net::Ipv6Addr::from(out))
}

fn hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_little_endian_ipv4_hex() {
        // 0100007F is 127.0.0.1 in /proc/net/tcp's byte order.
        let ip = parse_ipv4_hex("0100007F").unwrap();
        assert_eq!(ip, std::net::Ipv4Addr::new(127, 0, 0, 1));
    }

    #[test]
    fn parses_ipv6_word_reversed_hex() {
        // ::1 is encoded as 00000000000000000000000001000000 truncated to
        // 32 hex chars with the last word's low byte set.
        let hex = "00000000000000000000000001000000";
        let ip = parse_ipv6_hex(&hex[..32]).unwrap();
        assert_eq!(ip, std::net::Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn parses_sockaddr_field() {
        let (ip, port) = parse_hex_sockaddr("0100007F:0050").unwrap();
        assert_eq!(ip, IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 80);
    }

    #[test]
    fn uid_unknown_displays_as_negative_one() {
        assert_eq!(Uid::Unknown.to_string(), "-1");
        assert_eq!(Uid::Unknown.as_i64(), -1);
    }
}
