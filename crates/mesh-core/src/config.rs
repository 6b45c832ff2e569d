//! Node configuration.
//!
//! A plain value type, not a loader: parsing these fields from CLI flags,
//! environment variables, or config files is out of scope here (see
//! `spec.md` §1) and is left to the embedding application, the way
//! `ouisync`'s `NetworkOptions` carries the values but a `structopt` derive
//! on top of it does the parsing — we keep the struct, not the derive.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub addr: std::net::SocketAddr,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Shared local service port; IPv4/IPv6/local-segment TCP listeners and
    /// DHT nodes bind to this port (0 lets the OS choose).
    pub service_port: u16,
    /// Outbound proxy, if any. When set, all internet-bound transport
    /// connects route through it and UPnP is disabled.
    pub proxy: Option<ProxyConfig>,
    /// Enables the anonymity-overlay DHT node, SOCKS endpoint, and hidden
    /// service bring-up.
    pub overlay_enabled: bool,
    /// Path to the external overlay-controller binary `overlay.rs` spawns
    /// when `overlay_enabled` is set. Ignored otherwise.
    pub overlay_controller_path: String,
    /// Forces all outbound connects through the anonymity overlay
    /// regardless of the target endpoint's address family.
    pub overlay_only: bool,
    /// Enables per-interface local-network DHT managers and beaconing.
    pub local_discovery_enabled: bool,
    /// Enables the reachability state machine's UPnP sub-state machine.
    pub upnp_enabled: bool,
    /// Well-known HTTPS URL serving the bootstrap blob (§6).
    pub bootstrap_url: String,
    /// Family-partitioned bootstrap endpoints seeded into the DHT nodes at
    /// construction, before the asynchronous blob fetch completes.
    pub bootstrap_seeds: Vec<crate::endpoint::Endpoint>,
    pub connect_timeout_lan: Duration,
    pub connect_timeout_internet: Duration,
    pub connect_timeout_overlay: Duration,
    /// Unauthenticated IPv4-only web probe used by the reachability state
    /// machine to sanity-check general internet reachability.
    pub ipv4_probe_url: String,
    /// Same, IPv6-only.
    pub ipv6_probe_url: String,
    /// Incoming-connection web-check: the service dials back `?port=` over
    /// HTTP and reports whether the node is reachable from outside.
    pub incoming_check_url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_port: 0,
            proxy: None,
            overlay_enabled: false,
            overlay_controller_path: "overlay-controller".to_string(),
            overlay_only: false,
            local_discovery_enabled: true,
            upnp_enabled: true,
            bootstrap_url: "https://bootstrap.invalid/nodes".to_string(),
            bootstrap_seeds: Vec::new(),
            connect_timeout_lan: Duration::from_secs(2),
            connect_timeout_internet: Duration::from_secs(10),
            connect_timeout_overlay: Duration::from_secs(30),
            ipv4_probe_url: "https://v4.reachability.invalid/probe".to_string(),
            ipv6_probe_url: "https://v6.reachability.invalid/probe".to_string(),
            incoming_check_url: "https://reachability.invalid/incoming-check".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_proxy_and_upnp_on() {
        let cfg = NodeConfig::default();
        assert!(cfg.proxy.is_none());
        assert!(cfg.upnp_enabled);
        assert!(!cfg.overlay_enabled);
    }
}
