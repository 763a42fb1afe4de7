//! Advertise address discovery.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

/// Maps IPv4-mapped IPv6 addresses back to IPv4.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    // RFC 1918 plus the RFC 6598 shared range used by carrier-grade NAT
    ip.is_private() || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64)
}

fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// Source address the kernel would use to reach `target`. No packet is sent.
fn route_source(bind: SocketAddr, target: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

/// Finds a private, non-loopback IPv4 address of this host.
pub fn pick_private_ipv4() -> Option<Ipv4Addr> {
    let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    [
        Ipv4Addr::new(10, 255, 255, 255),
        Ipv4Addr::new(172, 31, 255, 255),
        Ipv4Addr::new(192, 168, 255, 255),
        Ipv4Addr::new(100, 127, 255, 255),
        Ipv4Addr::new(8, 8, 8, 8),
    ]
    .into_iter()
    .filter_map(|target| route_source(unspecified, SocketAddr::from((target, 9))))
    .find_map(|ip| match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && is_private_v4(v4) => Some(v4),
        _ => None,
    })
}

/// Finds a non-loopback IPv6 address of this host, unique-local preferred.
pub fn pick_unique_local_ipv6() -> Option<Ipv6Addr> {
    let unspecified = SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0));
    let candidates: Vec<Ipv6Addr> = [
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1),
        Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888),
    ]
    .into_iter()
    .filter_map(|target| route_source(unspecified, SocketAddr::from((target, 9))))
    .filter_map(|ip| match ip {
        IpAddr::V6(v6) if !v6.is_loopback() && !v6.is_unspecified() => Some(v6),
        _ => None,
    })
    .collect();

    candidates
        .iter()
        .copied()
        .find(|ip| is_unique_local_v6(*ip))
        .or_else(|| candidates.first().copied())
}
