//! Common types for MailGuard

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Packet filter address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// IPv4 (`ip` in nftables)
    Ip,
    /// IPv6 (`ip6` in nftables)
    Ip6,
}

impl Family {
    /// Name of the family in the nftables command protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
        }
    }

    /// Family of a network
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::Ip,
            IpNet::V6(_) => Family::Ip6,
        }
    }

    /// Widest prefix length for the family
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            Family::Ip => 32,
            Family::Ip6 => 128,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an address that may be banned.
///
/// IPv4-mapped IPv6 addresses are unwrapped. Private, loopback, link-local,
/// unspecified and reserved addresses are never banned and yield `None`.
pub fn bannable_ip(address: &str) -> Option<IpAddr> {
    let ip: IpAddr = address.trim().parse().ok()?;
    let ip = match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    };

    if is_private_ip(&ip) {
        None
    } else {
        Some(ip)
    }
}

/// Addresses that never identify a remote offender
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            let [first, ..] = ipv4.octets();
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                // 0.0.0.0/8 "this network"
                || first == 0
                // 240.0.0.0/4 reserved
                || first >= 240
        }
        IpAddr::V6(ipv6) => {
            let [head, ..] = ipv6.segments();
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 unique local
                || (head & 0xfe00) == 0xfc00
                // fe80::/10 link-local
                || (head & 0xffc0) == 0xfe80
        }
    }
}

/// Return whether the given entry is an address or a network literal
pub fn is_ip(address: &str) -> bool {
    parse_network(address).is_some()
}

/// Parse an address or CIDR network, truncating host bits.
///
/// A bare address becomes a single-host network.
pub fn parse_network(address: &str) -> Option<IpNet> {
    let address = address.trim();
    if let Ok(net) = address.parse::<IpNet>() {
        return Some(net.trunc());
    }
    address.parse::<IpAddr>().ok().map(host_network)
}

/// Single-host network for an address
pub fn host_network(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

/// Return whether two networks share at least one address
pub fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}
