//! Reachability state machine (C7): tracks, once per IP family, whether this
//! node is directly reachable, behind a NAT it can traverse via UPnP, behind
//! one it cannot, or routed through a configured proxy.
//!
//! Single-writer: only the periodic run loop (and `recheck_connectivity`,
//! which shares the same code path) ever mutates the state. Readers may
//! observe a stale value between runs — that is an accepted tradeoff, not a
//! bug (spec §5).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};

use crate::config::{NodeConfig, ProxyKind};
use crate::upnp::{IgdUpnpClient, UpnpClient, UpnpOutcome};

const RUN_INTERVAL: Duration = Duration::from_secs(60);
const PROXY_REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpnpSubstate {
    ExternalIpPrivate,
    PortForwarded,
    /// The gateway answered with a public external IP but its
    /// `AddPortMapping` call itself was rejected.
    PortForwardingFailed,
    /// A forward previously succeeded, but a later incoming-connection
    /// check found the port unreachable from outside.
    PortForwardedNotAccessible,
    DiscoveryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Status {
    Identifying,
    HttpProxyInternetConnection,
    Socks5ProxyInternetConnection,
    ProxyConnectionFailed,
    NoProxyInternetConnection,
    NoInternetConnection,
    DirectInternetConnection,
    /// UPnP disabled by config; behind a NAT/firewall of unknown traversability.
    NatOrFirewalledInternetConnection,
    NatViaUpnp(UpnpSubstate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Status {
    Identifying,
    HttpProxyInternetConnection,
    Socks5ProxyInternetConnection,
    ProxyConnectionFailed,
    NoProxyInternetConnection,
    NoInternetConnection,
    DirectInternetConnection,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ipv4State {
    status: Option<Ipv4Status>,
    local_live_ip: Option<Ipv4Addr>,
    upnp_external_ip: Option<Ipv4Addr>,
    probe_external_endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Ipv6State {
    status: Option<Ipv6Status>,
    local_live_ip: Option<Ipv6Addr>,
}

/// The externally-observable checks the state machine drives. A production
/// `HttpWebProbe` hits the configured reachability services; tests supply a
/// stub.
#[async_trait::async_trait]
pub trait WebProbe: Send + Sync {
    async fn probe_ipv4(&self) -> bool;
    async fn probe_ipv6(&self) -> bool;
    /// The incoming-connection web-check (spec §6): `None` on failure,
    /// otherwise the external endpoint the service observed us connecting
    /// from.
    async fn incoming_connection_check(&self, local_port: u16) -> Option<SocketAddr>;
}

/// Unauthenticated GET probes and the incoming-connection web-check,
/// against the URLs configured in `NodeConfig`.
pub struct HttpWebProbe {
    client: reqwest::Client,
    ipv4_probe_url: String,
    ipv6_probe_url: String,
    incoming_check_url: String,
}

impl HttpWebProbe {
    pub fn new(cfg: &NodeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            ipv4_probe_url: cfg.ipv4_probe_url.clone(),
            ipv6_probe_url: cfg.ipv6_probe_url.clone(),
            incoming_check_url: cfg.incoming_check_url.clone(),
        }
    }
}

#[async_trait::async_trait]
impl WebProbe for HttpWebProbe {
    async fn probe_ipv4(&self) -> bool {
        self.client.get(&self.ipv4_probe_url).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    async fn probe_ipv6(&self) -> bool {
        self.client.get(&self.ipv6_probe_url).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }

    /// Response is `0x01` followed by a 4-byte IPv4 address and a
    /// little-endian `u16` port on success, or a lone `0x00` on failure
    /// (spec §6).
    async fn incoming_connection_check(&self, local_port: u16) -> Option<SocketAddr> {
        let response = self
            .client
            .get(&self.incoming_check_url)
            .query(&[("port", local_port.to_string())])
            .send()
            .await
            .ok()?;
        let body = response.bytes().await.ok()?;
        decode_incoming_check_response(&body)
    }
}

fn decode_incoming_check_response(body: &[u8]) -> Option<SocketAddr> {
    if body.first() != Some(&0x01) || body.len() < 7 {
        return None;
    }
    let ip = Ipv4Addr::new(body[1], body[2], body[3], body[4]);
    let port = u16::from_le_bytes([body[5], body[6]]);
    Some(SocketAddr::new(ip.into(), port))
}

pub struct ReachabilityManager {
    cfg: NodeConfig,
    local_port: u16,
    probe: Box<dyn WebProbe>,
    upnp: Box<dyn UpnpClient>,
    ipv4: Mutex<Ipv4State>,
    ipv6: Mutex<Ipv6State>,
}

impl ReachabilityManager {
    pub fn new(cfg: NodeConfig, local_port: u16, probe: Box<dyn WebProbe>) -> Self {
        Self::with_upnp_client(cfg, local_port, probe, Box::new(IgdUpnpClient))
    }

    pub fn with_upnp_client(
        cfg: NodeConfig,
        local_port: u16,
        probe: Box<dyn WebProbe>,
        upnp: Box<dyn UpnpClient>,
    ) -> Self {
        Self {
            cfg,
            local_port,
            probe,
            upnp,
            ipv4: Mutex::new(Ipv4State::default()),
            ipv6: Mutex::new(Ipv6State::default()),
        }
    }

    pub fn ipv4_status(&self) -> Ipv4Status {
        self.ipv4.lock().status.unwrap_or(Ipv4Status::Identifying)
    }

    pub fn ipv6_status(&self) -> Ipv6Status {
        self.ipv6.lock().status.unwrap_or(Ipv6Status::Identifying)
    }

    /// External endpoint derivation (spec §4.7): `Identifying` yields none;
    /// `Direct` reports the local live IP; `NatViaUpnp(PortForwarded)`
    /// reports the UPnP-discovered external IP; every other resolvable
    /// state reports whatever the incoming-connection probe last observed.
    pub fn ipv4_external_endpoint(&self) -> Option<SocketAddr> {
        let state = self.ipv4.lock();
        match state.status? {
            Ipv4Status::Identifying => None,
            Ipv4Status::DirectInternetConnection => {
                state.local_live_ip.map(|ip| SocketAddr::new(ip.into(), self.local_port))
            }
            Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwarded) => {
                state.upnp_external_ip.map(|ip| SocketAddr::new(ip.into(), self.local_port))
            }
            _ => state.probe_external_endpoint,
        }
    }

    /// IPv6 only ever reports an endpoint in the `Direct` state.
    pub fn ipv6_external_endpoint(&self) -> Option<SocketAddr> {
        let state = self.ipv6.lock();
        match state.status? {
            Ipv6Status::DirectInternetConnection => {
                state.local_live_ip.map(|ip| SocketAddr::new(ip.into(), self.local_port))
            }
            _ => None,
        }
    }

    /// Runs both family cycles once immediately, outside the periodic timer.
    pub async fn recheck_connectivity(&self) {
        self.run_ipv4_cycle().await;
        self.run_ipv6_cycle().await;
    }

    /// Drives both family cycles every 60s until the returned task is
    /// aborted.
    pub async fn run_periodic(&self) {
        let mut ticker = interval(RUN_INTERVAL);
        loop {
            ticker.tick().await;
            self.recheck_connectivity().await;
        }
    }

    async fn run_ipv4_cycle(&self) {
        let (status, local_live_ip, upnp_external_ip) = self.classify_ipv4().await;
        let previous = {
            let state = self.ipv4.lock();
            (state.status, state.probe_external_endpoint)
        };

        let mut state = self.ipv4.lock();
        state.status = Some(status);
        state.local_live_ip = local_live_ip;
        state.upnp_external_ip = upnp_external_ip;
        drop(state);

        self.validate_ipv4(status, previous).await;
    }

    /// Steps 1-5 of the IPv4 flow: proxy short-circuit, default-interface
    /// discovery, public-address short-circuit, then UPnP.
    async fn classify_ipv4(&self) -> (Ipv4Status, Option<Ipv4Addr>, Option<Ipv4Addr>) {
        if let Some(proxy) = &self.cfg.proxy {
            let status = match proxy.kind {
                ProxyKind::Http => Ipv4Status::HttpProxyInternetConnection,
                ProxyKind::Socks5 => Ipv4Status::Socks5ProxyInternetConnection,
            };
            return (status, None, None);
        }

        let Some(local_ip) = default_ipv4_interface() else {
            return (Ipv4Status::NoInternetConnection, None, None);
        };

        if !is_private_v4(local_ip) {
            return (Ipv4Status::DirectInternetConnection, Some(local_ip), None);
        }

        if !self.cfg.upnp_enabled {
            return (Ipv4Status::NatOrFirewalledInternetConnection, Some(local_ip), None);
        }

        let local_addr = SocketAddrV4::new(local_ip, self.local_port);
        let outcome = self.upnp.discover_and_forward(local_addr).await;
        let (status, upnp_ip) = classify_upnp_outcome(outcome);
        (status, Some(local_ip), upnp_ip)
    }

    /// Step 6: re-validate with web probes when the status or endpoint
    /// changed, and run the incoming-connection check for the states the
    /// spec names.
    async fn validate_ipv4(&self, status: Ipv4Status, previous: (Option<Ipv4Status>, Option<SocketAddr>)) {
        if status == Ipv4Status::NoInternetConnection {
            return;
        }

        if matches!(status, Ipv4Status::HttpProxyInternetConnection | Ipv4Status::Socks5ProxyInternetConnection) {
            let proxy_addr = self.cfg.proxy.as_ref().map(|p| p.addr);
            let Some(proxy_addr) = proxy_addr else { return };
            let reachable = timeout(PROXY_REACHABILITY_TIMEOUT, TcpStream::connect(proxy_addr)).await.is_ok();
            if !reachable {
                self.ipv4.lock().status = Some(Ipv4Status::ProxyConnectionFailed);
                return;
            }
            if !self.probe.probe_ipv4().await {
                self.ipv4.lock().status = Some(Ipv4Status::NoProxyInternetConnection);
            }
            return;
        }

        let (prev_status, prev_endpoint) = previous;
        let changed = prev_status != Some(status) || prev_endpoint != self.ipv4.lock().probe_external_endpoint;
        if !changed {
            return;
        }

        if !self.probe.probe_ipv4().await {
            self.ipv4.lock().status = Some(Ipv4Status::NoInternetConnection);
            return;
        }

        let needs_incoming_check = matches!(
            status,
            Ipv4Status::DirectInternetConnection
                | Ipv4Status::NatOrFirewalledInternetConnection
                | Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwarded)
        );
        if !needs_incoming_check {
            return;
        }

        match self.probe.incoming_connection_check(self.local_port).await {
            Some(endpoint) => self.ipv4.lock().probe_external_endpoint = Some(endpoint),
            None => {
                let mut state = self.ipv4.lock();
                state.probe_external_endpoint = None;
                if status == Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwarded) {
                    state.status = Some(Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwardedNotAccessible));
                }
            }
        }
    }

    /// The IPv6 flow (spec §4.7): identical proxy handling, no UPnP.
    async fn run_ipv6_cycle(&self) {
        let status = if let Some(proxy) = &self.cfg.proxy {
            match proxy.kind {
                ProxyKind::Http => Ipv6Status::HttpProxyInternetConnection,
                ProxyKind::Socks5 => Ipv6Status::Socks5ProxyInternetConnection,
            }
        } else {
            match default_ipv6_interface() {
                Some(ip) if !is_private_v6(ip) => Ipv6Status::DirectInternetConnection,
                Some(_) => Ipv6Status::NoInternetConnection,
                None => Ipv6Status::NoInternetConnection,
            }
        };

        let local_live_ip = match status {
            Ipv6Status::DirectInternetConnection => default_ipv6_interface(),
            _ => None,
        };

        {
            let mut state = self.ipv6.lock();
            state.status = Some(status);
            state.local_live_ip = local_live_ip;
        }

        if matches!(status, Ipv6Status::HttpProxyInternetConnection | Ipv6Status::Socks5ProxyInternetConnection) {
            let proxy_addr = self.cfg.proxy.as_ref().map(|p| p.addr);
            if let Some(proxy_addr) = proxy_addr {
                let reachable = timeout(PROXY_REACHABILITY_TIMEOUT, TcpStream::connect(proxy_addr)).await.is_ok();
                if !reachable {
                    self.ipv6.lock().status = Some(Ipv6Status::ProxyConnectionFailed);
                } else if !self.probe.probe_ipv6().await {
                    self.ipv6.lock().status = Some(Ipv6Status::NoProxyInternetConnection);
                }
            }
            return;
        }

        if status == Ipv6Status::DirectInternetConnection && !self.probe.probe_ipv6().await {
            self.ipv6.lock().status = Some(Ipv6Status::NoInternetConnection);
        }
    }
}

/// Translate a raw UPnP discovery/forward outcome into the status and
/// external-IP fields the IPv4 cycle records (spec §4.7 step 5: "0.0.0.0
/// means no internet", private maps to `ExternalIpPrivate`, a completed
/// `add_port` call maps to `PortForwarded`, a rejected one on a public IP
/// maps to `PortForwardingFailed`). `PortForwardedNotAccessible` is never
/// produced here — it is only reached by `validate_ipv4`'s post-hoc
/// incoming-check demotion of a previously-successful `PortForwarded`.
fn classify_upnp_outcome(outcome: UpnpOutcome) -> (Ipv4Status, Option<Ipv4Addr>) {
    match outcome {
        UpnpOutcome::DiscoveryFailed => (Ipv4Status::NatViaUpnp(UpnpSubstate::DiscoveryFailed), None),
        UpnpOutcome::ExternalIp { ip, .. } if ip.is_unspecified() => (Ipv4Status::NoInternetConnection, None),
        UpnpOutcome::ExternalIp { ip, port_forwarded: false } if is_private_v4(ip) => {
            (Ipv4Status::NatViaUpnp(UpnpSubstate::ExternalIpPrivate), Some(ip))
        }
        UpnpOutcome::ExternalIp { ip, port_forwarded: true } => {
            (Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwarded), Some(ip))
        }
        UpnpOutcome::ExternalIp { ip, port_forwarded: false } => {
            (Ipv4Status::NatViaUpnp(UpnpSubstate::PortForwardingFailed), Some(ip))
        }
    }
}

/// Simplified "default interface" discovery: the first live non-loopback
/// IPv4 interface, consistent with `dht.rs`'s local-network enumeration —
/// neither reads the OS routing table, both settle for "any live
/// interface" over a true default-route lookup (see DESIGN.md).
fn default_ipv4_interface() -> Option<Ipv4Addr> {
    if_addrs::get_if_addrs().ok()?.into_iter().filter(|i| !i.is_loopback()).find_map(|i| match i.addr {
        if_addrs::IfAddr::V4(v4) => Some(v4.ip),
        if_addrs::IfAddr::V6(_) => None,
    })
}

fn default_ipv6_interface() -> Option<Ipv6Addr> {
    if_addrs::get_if_addrs().ok()?.into_iter().filter(|i| !i.is_loopback()).find_map(|i| match i.addr {
        if_addrs::IfAddr::V6(v6) => Some(v6.ip),
        if_addrs::IfAddr::V4(_) => None,
    })
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00 || ip.is_unicast_link_local()
}
