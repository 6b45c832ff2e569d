//! Local-network DHT manager (C3): one instance per live non-loopback
//! interface (either family), owning a UDP beacon socket, a TCP listener,
//! and a DHT node bound to that listener's address.
//!
//! IPv4 interfaces beacon by broadcast; IPv6 interfaces beacon by joining
//! the `ff12::1` site-local multicast group on the interface's index (spec
//! §4.3). Two managers on two different IPv6 interfaces can share
//! `BEACON_PORT` because each joins the multicast group on its own
//! interface index rather than binding to a distinct unicast address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::beacon::{self, Beacon, BEACON_PORT};
use crate::config::NodeConfig;
use crate::dht::DhtNodeHandle;
use crate::endpoint::Endpoint;
use crate::error::CoreError;
use crate::handshake;
use crate::ids::PeerId;
use crate::registry::ConnectionRegistry;
use crate::transport;

/// Beacon burst: up to 3 sends spaced 2s apart, then a 60s re-arm check.
const BEACON_BURST_COUNT: usize = 3;
const BEACON_BURST_SPACING: Duration = Duration::from_secs(2);
const BEACON_REARM_INTERVAL: Duration = Duration::from_secs(60);
/// Re-arm the burst only while the segment looks sparsely populated.
const REARM_NODE_THRESHOLD: usize = 2;

/// A live, non-loopback interface a `LocalNetworkDhtManager` can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalInterface {
    V4 { ip: Ipv4Addr, broadcast: Ipv4Addr },
    /// `scope_id` is the interface index `join_multicast_v6` binds the
    /// `ff12::1` membership to.
    V6 { ip: Ipv6Addr, scope_id: u32 },
}

impl LocalInterface {
    pub fn addr(&self) -> IpAddr {
        match self {
            LocalInterface::V4 { ip, .. } => IpAddr::V4(*ip),
            LocalInterface::V6 { ip, .. } => IpAddr::V6(*ip),
        }
    }
}

pub struct LocalNetworkDhtManager {
    interface_addr: IpAddr,
    dht_node: Arc<DhtNodeHandle>,
    udp_task: JoinHandle<()>,
    tcp_task: JoinHandle<()>,
    announce_task: JoinHandle<()>,
}

impl LocalNetworkDhtManager {
    pub async fn spawn(
        iface: LocalInterface,
        cfg: NodeConfig,
        registry: Arc<ConnectionRegistry>,
        local_peer_id: PeerId,
    ) -> Result<Self, CoreError> {
        let interface_addr = iface.addr();
        let udp_socket = bind_beacon_socket(iface)?;
        let listen_endpoint = match interface_addr {
            IpAddr::V4(ip) => Endpoint::V4(ip, 0),
            IpAddr::V6(ip) => Endpoint::V6(ip, 0),
        };
        let listener = transport::listen(&listen_endpoint).await?;
        let bind_endpoint = Endpoint::from_socket_addr(listener.local_addr().map_err(CoreError::Io)?);
        let dht_node = DhtNodeHandle::new(bind_endpoint);
        let dht_port = dht_node.bind_endpoint().port();

        let announce_dest = match iface {
            LocalInterface::V4 { broadcast, .. } => beacon::ipv4_broadcast_dest(broadcast),
            LocalInterface::V6 { .. } => beacon::ipv6_multicast_dest(),
        };

        let udp_task = tokio::spawn(run_udp_receive_loop(udp_socket.clone(), dht_node.clone()));
        let tcp_task = tokio::spawn(run_tcp_accept_loop(listener, registry, local_peer_id));
        let announce_task = tokio::spawn(run_announce_timer(udp_socket, announce_dest, dht_port, dht_node.clone()));

        Ok(Self {
            interface_addr,
            dht_node,
            udp_task,
            tcp_task,
            announce_task,
        })
    }

    pub fn interface_addr(&self) -> IpAddr {
        self.interface_addr
    }

    pub fn dht_node(&self) -> &Arc<DhtNodeHandle> {
        &self.dht_node
    }
}

impl Drop for LocalNetworkDhtManager {
    fn drop(&mut self) {
        self.udp_task.abort();
        self.tcp_task.abort();
        self.announce_task.abort();
    }
}

/// Bind the beacon socket for `iface`, grounded on the `socket2`-then-convert-to-tokio
/// pattern used elsewhere in this ecosystem for discovery listeners.
fn bind_beacon_socket(iface: LocalInterface) -> Result<Arc<UdpSocket>, CoreError> {
    match iface {
        LocalInterface::V4 { ip, .. } => bind_beacon_socket_v4(ip),
        LocalInterface::V6 { scope_id, .. } => bind_beacon_socket_v6(scope_id),
    }
}

/// Bind to `interface_ip:41988` with address reuse and broadcast enabled.
fn bind_beacon_socket_v4(interface_ip: Ipv4Addr) -> Result<Arc<UdpSocket>, CoreError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(CoreError::Io)?;
    socket.set_reuse_address(true).map_err(CoreError::Io)?;
    socket.set_broadcast(true).map_err(CoreError::Io)?;
    socket.set_nonblocking(true).map_err(CoreError::Io)?;
    let addr = SocketAddrV4::new(interface_ip, BEACON_PORT);
    socket.bind(&addr.into()).map_err(CoreError::Io)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket).map_err(CoreError::Io)?;
    Ok(Arc::new(tokio_socket))
}

/// Bind to the unspecified address with reuse, so distinct interfaces can
/// each hold their own socket on the shared `BEACON_PORT`, then join
/// `ff12::1` and set it as the outgoing multicast interface on `scope_id`.
fn bind_beacon_socket_v6(scope_id: u32) -> Result<Arc<UdpSocket>, CoreError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(CoreError::Io)?;
    socket.set_reuse_address(true).map_err(CoreError::Io)?;
    socket.set_only_v6(true).map_err(CoreError::Io)?;
    socket.set_nonblocking(true).map_err(CoreError::Io)?;
    let addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, BEACON_PORT, 0, 0);
    socket.bind(&addr.into()).map_err(CoreError::Io)?;
    socket
        .join_multicast_v6(&beacon::IPV6_MULTICAST_GROUP, scope_id)
        .map_err(CoreError::Io)?;
    socket.set_multicast_if_v6(scope_id).map_err(CoreError::Io)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket).map_err(CoreError::Io)?;
    Ok(Arc::new(tokio_socket))
}

/// Receive loop: decode each datagram as a beacon and, if the sender's
/// derived endpoint differs from this node's own, insert it into the
/// routing table.
async fn run_udp_receive_loop(socket: Arc<UdpSocket>, dht_node: Arc<DhtNodeHandle>) {
    let mut buf = [0u8; 64];
    loop {
        let (n, sender) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("local DHT beacon recv failed: {e}");
                continue;
            }
        };
        let decoded = match Beacon::decode(&buf[..n]) {
            Ok(b) => b,
            Err(e) => {
                log::debug!("dropping malformed beacon from {sender}: {e}");
                continue;
            }
        };
        let peer_endpoint = beacon::endpoint_from_sender(sender, decoded);
        if peer_endpoint != dht_node.bind_endpoint() {
            dht_node.insert_node(peer_endpoint);
        }
    }
}

/// Accept loop: local-segment streams skip the HTTP decoy entirely (the
/// segment is private) and go straight into the connection-initiate
/// protocol.
async fn run_tcp_accept_loop(
    listener: tokio::net::TcpListener,
    registry: Arc<ConnectionRegistry>,
    local_peer_id: PeerId,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("local DHT listener accept failed: {e}");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            // A version-0 DHT channel stream is handed here too (the same
            // demux handshake::accept uses for internet connections); the
            // wire protocol for querying a remote node's table is out of
            // scope, so it is simply dropped once accepted.
            match handshake::accept(stream, remote_addr, local_peer_id, &registry).await {
                Ok(handshake::Accepted::Peer(_)) | Ok(handshake::Accepted::DhtChannel(_)) => {}
                Err(e) => log::debug!("local DHT handshake from {remote_addr} failed: {e}"),
            }
        });
    }
}

/// Announce timer: a burst of up to 3 beacon sends spaced 2s apart, then a
/// 60s wait; the burst re-arms only while the segment still looks sparse.
async fn run_announce_timer(socket: Arc<UdpSocket>, dest: SocketAddr, dht_port: u16, dht_node: Arc<DhtNodeHandle>) {
    let payload = Beacon { dht_port }.encode();

    loop {
        for i in 0..BEACON_BURST_COUNT {
            if let Err(e) = socket.send_to(&payload, dest).await {
                log::warn!("local DHT beacon send to {dest} failed: {e}");
            }
            if i + 1 < BEACON_BURST_COUNT {
                sleep(BEACON_BURST_SPACING).await;
            }
        }

        sleep(BEACON_REARM_INTERVAL).await;
        if dht_node.known_node_count() >= REARM_NODE_THRESHOLD {
            break;
        }
    }
}
