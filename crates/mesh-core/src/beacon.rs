//! Local-network discovery beacon (C2): a 3-byte UDP packet advertising
//! this node's local-segment DHT port.
//!
//! Broadcast on IPv4, or sent to the well-known site-local multicast group
//! `ff12::1` on IPv6, both on UDP port 41988.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::CoreError;

pub const BEACON_PORT: u16 = 41988;
pub const BEACON_VERSION: u8 = 1;

/// `ff12::1`, the site-local multicast group local discovery joins on IPv6.
pub const IPV6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff12, 0, 0, 0, 0, 0, 0, 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub dht_port: u16,
}

impl Beacon {
    /// Encode as `[version=1][dhtPort little-endian u16]` — 3 bytes total.
    pub fn encode(&self) -> [u8; 3] {
        let port_bytes = self.dht_port.to_le_bytes();
        [BEACON_VERSION, port_bytes[0], port_bytes[1]]
    }

    /// Decode a received datagram. Fails with `UnsupportedBeaconVersion` if
    /// the version byte is not `1`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < 3 {
            return Err(CoreError::BadHandshake("beacon packet too short".into()));
        }
        if bytes[0] != BEACON_VERSION {
            return Err(CoreError::UnsupportedBeaconVersion(bytes[0]));
        }
        let dht_port = u16::from_le_bytes([bytes[1], bytes[2]]);
        Ok(Beacon { dht_port })
    }
}

/// Combine the sender IP of a received beacon datagram with the advertised
/// port to form the sender's local-segment DHT endpoint.
pub fn endpoint_from_sender(sender: SocketAddr, beacon: Beacon) -> crate::endpoint::Endpoint {
    match sender.ip() {
        IpAddr::V4(ip) => crate::endpoint::Endpoint::V4(ip, beacon.dht_port),
        IpAddr::V6(ip) => crate::endpoint::Endpoint::V6(ip, beacon.dht_port),
    }
}

/// Destination for an IPv4 beacon broadcast on the given interface's
/// broadcast address.
pub fn ipv4_broadcast_dest(broadcast_ip: Ipv4Addr) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(broadcast_ip), BEACON_PORT)
}

/// Destination for an IPv6 beacon multicast send.
pub fn ipv6_multicast_dest() -> SocketAddr {
    SocketAddr::new(IpAddr::V6(IPV6_MULTICAST_GROUP), BEACON_PORT)
}
