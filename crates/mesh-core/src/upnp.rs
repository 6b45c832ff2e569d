//! UPnP gateway discovery and port forwarding, wrapped for the reachability
//! state machine's NAT-traversal sub-step (C7).
//!
//! Grounded on the blocking `igd`-crate gateway-search/add-port sequence
//! used elsewhere in this ecosystem for exactly this purpose, translated to
//! `igd-next`'s async tokio client so it runs on the same executor as the
//! rest of the node instead of a dedicated OS thread.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};

const GATEWAY_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);
/// `0` requests an unbounded (i.e. until explicitly removed) UPnP lease.
const LEASE_DURATION_SECS: u32 = 0;
const PORT_MAPPING_DESCRIPTION: &str = "mesh-core peer listener";

/// Outcome of a gateway-discovery-and-forward attempt. The caller (the
/// reachability state machine) owns interpreting this into a status —
/// this module only wraps the IGD mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpOutcome {
    /// No gateway responded, or it did not answer `GetExternalIPAddress`.
    DiscoveryFailed,
    /// A gateway answered with this external IP. `port_forwarded` is true
    /// only if an `AddPortMapping` call for `local_addr`'s port also
    /// succeeded (attempted only when the IP looks like a real public
    /// address).
    ExternalIp { ip: Ipv4Addr, port_forwarded: bool },
}

/// Wraps `igd-next` behind a small trait so the reachability state machine
/// can be driven in tests by a fake gateway instead of a real network.
#[async_trait::async_trait]
pub trait UpnpClient: Send + Sync {
    async fn discover_and_forward(&self, local_addr: SocketAddrV4) -> UpnpOutcome;
}

/// Production `UpnpClient`: real gateway discovery and port mapping via
/// `igd-next`'s async tokio client.
#[derive(Default)]
pub struct IgdUpnpClient;

#[async_trait::async_trait]
impl UpnpClient for IgdUpnpClient {
    async fn discover_and_forward(&self, local_addr: SocketAddrV4) -> UpnpOutcome {
        attempt_port_forward(local_addr).await
    }
}

/// Discover a gateway reachable from `local_addr`'s interface, read its
/// external IP, and — if that IP is a plausible public address — forward
/// `local_addr`'s TCP port through it.
async fn attempt_port_forward(local_addr: SocketAddrV4) -> UpnpOutcome {
    let options = SearchOptions {
        timeout: Some(GATEWAY_SEARCH_TIMEOUT),
        ..Default::default()
    };

    let gateway = match search_gateway(options).await {
        Ok(g) => g,
        Err(e) => {
            log::debug!("UPnP gateway search failed: {e}");
            return UpnpOutcome::DiscoveryFailed;
        }
    };

    let external_ip = match gateway.get_external_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            log::debug!("UPnP external IP request failed: {e}");
            return UpnpOutcome::DiscoveryFailed;
        }
    };

    if external_ip.is_unspecified() || is_private_v4(external_ip) {
        return UpnpOutcome::ExternalIp { ip: external_ip, port_forwarded: false };
    }

    let port_forwarded = gateway
        .add_port(
            PortMappingProtocol::TCP,
            local_addr.port(),
            local_addr,
            LEASE_DURATION_SECS,
            PORT_MAPPING_DESCRIPTION,
        )
        .await
        .map_err(|e| log::debug!("UPnP add_port failed: {e}"))
        .is_ok();

    UpnpOutcome::ExternalIp { ip: external_ip, port_forwarded }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_unspecified_addresses_are_recognized() {
        assert!(is_private_v4(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(is_private_v4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!is_private_v4(Ipv4Addr::new(203, 0, 113, 1)));
    }
}
