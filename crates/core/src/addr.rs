//! Multiaddr classification
//!
//! Splits transport addresses into public and private/loopback/link-local.
//! The probe only reports public addresses and, under the default gate
//! policy, refuses to dial anything else — a provider advertising
//! `192.168.x.x` must not look reachable just because the operator's own
//! LAN happens to answer.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;

/// Outbound dial policy applied by a probe host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFilter {
    /// Refuse private, loopback, and link-local addresses.
    #[default]
    PublicOnly,
    /// Dial anything. Used by in-process test harnesses that talk over
    /// loopback.
    AllowAll,
}

impl AddrFilter {
    /// Whether this policy permits dialing the given address.
    pub fn allows(&self, addr: &Multiaddr) -> bool {
        match self {
            AddrFilter::PublicOnly => is_public_multiaddr(addr),
            AddrFilter::AllowAll => true,
        }
    }
}

/// Whether a multiaddr's transport endpoint is publicly routable.
///
/// DNS names are treated as public (they resolve to whatever they
/// resolve to); raw IPs are classified by range. Addresses with no IP or
/// DNS component (unix sockets, bare /p2p) are not public.
pub fn is_public_multiaddr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => is_public_v4(ip),
        Some(Protocol::Ip6(ip)) => is_public_v6(ip),
        Some(Protocol::Dns(_))
        | Some(Protocol::Dns4(_))
        | Some(Protocol::Dns6(_))
        | Some(Protocol::Dnsaddr(_)) => true,
        _ => false,
    }
}

/// Keep only the public addresses, preserving order.
pub fn filter_public(addrs: &[Multiaddr]) -> Vec<Multiaddr> {
    addrs
        .iter()
        .filter(|a| is_public_multiaddr(a))
        .cloned()
        .collect()
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    if ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
    {
        return false;
    }
    // Carrier-grade NAT range (100.64.0.0/10) is not reachable from the
    // open internet either.
    let o = ip.octets();
    !(o[0] == 100 && (o[1] & 0xc0) == 64)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(v4);
    }
    let seg = ip.segments();
    // fc00::/7 unique-local, fe80::/10 link-local.
    if (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80 {
        return false;
    }
    true
}
