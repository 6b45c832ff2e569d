//! Transport endpoints and the transport kinds that dispatch over them.
//!
//! Endpoints are compared structurally. IPv4-mapped IPv6 addresses are
//! always normalized to their IPv4 form, and IPv6 scope ids are always
//! stripped, before an endpoint is inserted into or looked up from any
//! table. Centralizing that here (rather than at every call site) is the
//! one thing worth getting right — see the design note in `spec.md` §9.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// One of the four transports a peer may be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    IPv4Internet,
    IPv6Internet,
    LocalNetwork,
    AnonymityOverlay,
}

/// A tagged-union network address. Construction always normalizes, so two
/// `Endpoint`s that describe the same peer compare equal regardless of how
/// they were originally spelled.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    /// `.onion`-style domain endpoint reached through the anonymity
    /// overlay; address family marker is `Unspecified`.
    Domain(String, u16),
}

impl Endpoint {
    /// Build an endpoint from a socket address, normalizing IPv4-mapped
    /// IPv6 addresses to plain IPv4 and stripping any IPv6 scope id.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::V4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => {
                if let Some(v4) = v6.ip().to_ipv4_mapped() {
                    Endpoint::V4(v4, v6.port())
                } else {
                    Endpoint::V6(*v6.ip(), v6.port())
                }
            }
        }
    }

    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Domain(host.into(), port)
    }

    pub fn kind(&self, overlay_enabled: bool) -> TransportKind {
        match self {
            Endpoint::V4(ip, _) => {
                if is_private_or_local_v4(*ip) {
                    TransportKind::LocalNetwork
                } else {
                    TransportKind::IPv4Internet
                }
            }
            Endpoint::V6(ip, _) => {
                if is_private_or_local_v6(ip) {
                    TransportKind::LocalNetwork
                } else {
                    TransportKind::IPv6Internet
                }
            }
            Endpoint::Domain(..) => {
                if overlay_enabled {
                    TransportKind::AnonymityOverlay
                } else {
                    TransportKind::IPv4Internet
                }
            }
        }
    }

    /// True for RFC 1918 / link-local / loopback addresses — used by the
    /// registry's `AllowNewConnection` rule, which prefers a public address
    /// observed second over a stale private one.
    pub fn is_private(&self) -> bool {
        match self {
            Endpoint::V4(ip, _) => is_private_or_local_v4(*ip),
            Endpoint::V6(ip, _) => is_private_or_local_v6(ip),
            Endpoint::Domain(..) => false,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::V4(_, p) | Endpoint::V6(_, p) => *p,
            Endpoint::Domain(_, p) => *p,
        }
    }

    /// Return a copy of this endpoint with the port replaced. Used by the
    /// handshake's server side to rewrite the inbound ephemeral port to the
    /// peer's advertised service port.
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Endpoint::V4(ip, _) => Endpoint::V4(*ip, port),
            Endpoint::V6(ip, _) => Endpoint::V6(*ip, port),
            Endpoint::Domain(host, _) => Endpoint::Domain(host.clone(), port),
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::V4(ip, port) => Some(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            Endpoint::V6(ip, port) => Some(SocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, 0))),
            Endpoint::Domain(..) => None,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4(ip, port) => write!(f, "{}:{}", ip, port),
            Endpoint::V6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Endpoint::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

fn is_private_or_local_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn is_private_or_local_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_or_local_v4(v4);
    }
    ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00 || ip.is_unicast_link_local()
}
