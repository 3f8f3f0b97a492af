//! Proxy selection: which upstream a given flow should be dialed through.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::uid::Uid;

/// The kind of upstream a [`ProxyDescriptor`] dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    Socks5 {
        username: Option<String>,
        password: Option<String>,
    },
    HttpConnect {
        auth_header: String,
    },
    Tls,
    /// Dial the flow's own destination directly, bypassing any proxy.
    Transparent,
}

#[derive(Debug, Clone)]
pub struct ProxyDescriptor {
    pub address: SocketAddr,
    pub kind: ProxyKind,
}

/// Selects a [`ProxyDescriptor`] for a flow by UID, with a default
/// fallback, and forces [`ProxyKind::Transparent`] for flows that
/// shouldn't be proxied at all.
#[derive(Default)]
pub struct ProxySelector {
    by_uid: HashMap<i64, ProxyDescriptor>,
    default: Option<ProxyDescriptor>,
}

impl ProxySelector {
    pub fn new() -> Self {
        ProxySelector::default()
    }

    pub fn set_default(&mut self, descriptor: ProxyDescriptor) {
        self.default = Some(descriptor);
    }

    pub fn add_for_uid(&mut self, uid: i64, descriptor: ProxyDescriptor) {
        self.by_uid.insert(uid, descriptor);
    }

    /// Picks the descriptor that should be used for a flow to
    /// `(dest_ip, dest_port)` owned by `uid`.
    ///
    /// Flows to a destination port other than 80/443, or to a private
    /// address, are always forced transparent regardless of the
    /// configured proxy for that UID — those flows are never meant to
    /// cross an HTTP-aware proxy.
    pub fn select(&self, uid: Uid, dest_ip: IpAddr, dest_port: u16) -> Option<ProxyDescriptor> {
        if dest_port != 80 && dest_port != 443 {
            return Some(transparent(dest_ip, dest_port));
        }
        if is_private(dest_ip) {
            return Some(transparent(dest_ip, dest_port));
        }

        let key = uid.as_i64();
        self.by_uid
            .get(&key)
            .or(self.default.as_ref())
            .cloned()
    }
}

fn transparent(dest_ip: IpAddr, dest_port: u16) -> ProxyDescriptor {
    ProxyDescriptor {
        address: SocketAddr::new(dest_ip, dest_port),
        kind: ProxyKind::Transparent,
    }
}

/// `true` for RFC 1918 / RFC 4193 / loopback / link-local addresses.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || v6.is_unicast_link_local()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ProxyDescriptor {
        ProxyDescriptor {
            address: "203.0.113.1:1080".parse().unwrap(),
            kind: ProxyKind::Socks5 {
                username: None,
                password: None,
            },
        }
    }

    #[test]
    fn non_web_ports_are_forced_transparent() {
        let mut sel = ProxySelector::new();
        sel.set_default(descriptor());
        let picked = sel
            .select(Uid::Known(1000), "203.0.113.5".parse().unwrap(), 22)
            .unwrap();
        assert_eq!(picked.kind, ProxyKind::Transparent);
    }

    #[test]
    fn private_destinations_are_forced_transparent() {
        let mut sel = ProxySelector::new();
        sel.set_default(descriptor());
        let picked = sel
            .select(Uid::Known(1000), "192.168.1.5".parse().unwrap(), 443)
            .unwrap();
        assert_eq!(picked.kind, ProxyKind::Transparent);
    }

    #[test]
    fn uid_specific_override_wins_over_default() {
        let mut sel = ProxySelector::new();
        sel.set_default(descriptor());
        sel.add_for_uid(
            42,
            ProxyDescriptor {
                address: "203.0.113.2:8080".parse().unwrap(),
                kind: ProxyKind::HttpConnect {
                    auth_header: "token".into(),
                },
            },
        );
        let picked = sel
            .select(Uid::Known(42), "203.0.113.9".parse().unwrap(), 443)
            .unwrap();
        assert_eq!(picked.address, "203.0.113.2:8080".parse().unwrap());
    }

    #[test]
    fn unknown_uid_falls_back_to_default() {
        let mut sel = ProxySelector::new();
        sel.set_default(descriptor());
        let picked = sel
            .select(Uid::Unknown, "203.0.113.9".parse().unwrap(), 80)
            .unwrap();
        assert_eq!(picked.address, descriptor().address);
    }
}
