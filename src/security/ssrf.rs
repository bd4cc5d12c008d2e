//! SSRF address classification.
//!
//! The dispatcher resolves the target host and refuses to connect when any
//! resolved address falls in a non-routable or internal range. The checks
//! cover both IPv4 and IPv6, including v4-mapped v6 addresses.

use std::net::IpAddr;

/// Address classes the proxy refuses to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedRange {
    Unspecified,
    Loopback,
    LinkLocal,
    Private,
    Reserved,
}

/// Classify an address, returning the blocked range it falls in, if any.
pub fn blocked_range(addr: &IpAddr) -> Option<BlockedRange> {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            if v4.is_unspecified() {
                Some(BlockedRange::Unspecified)
            } else if v4.is_loopback() {
                Some(BlockedRange::Loopback)
            } else if v4.is_link_local() {
                Some(BlockedRange::LinkLocal)
            } else if v4.is_private() {
                Some(BlockedRange::Private)
            } else if v4.is_broadcast()
                || v4.is_documentation()
                || octets[0] >= 240
                // Carrier-grade NAT, 100.64.0.0/10.
                || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
                // Benchmarking, 198.18.0.0/15.
                || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
            {
                Some(BlockedRange::Reserved)
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return blocked_range(&IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            if v6.is_unspecified() {
                Some(BlockedRange::Unspecified)
            } else if v6.is_loopback() {
                Some(BlockedRange::Loopback)
            // fe80::/10 link-local.
            } else if (segments[0] & 0xffc0) == 0xfe80 {
                Some(BlockedRange::LinkLocal)
            // fc00::/7 unique-local.
            } else if (segments[0] & 0xfe00) == 0xfc00 {
                Some(BlockedRange::Private)
            // 2001:db8::/32 documentation.
            } else if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                Some(BlockedRange::Reserved)
            } else {
                None
            }
        }
    }
}
