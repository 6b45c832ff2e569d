//! Relay coordinator (C8): the client-side relay-connection pool, the
//! server-side per-network relay-membership table, and virtual (tunneled)
//! connection dialing.
//!
//! Grounded on `core-mesh`'s `relay.rs` for the shape of a coordinator
//! that tracks a bounded set of connections it is responsible for (there:
//! packet routing over libp2p streams; here: TCP connection bridging) and
//! on its `nat.rs` for the single-writer periodic-run-loop pattern the
//! client pool's fill timer reuses.
//!
//! A wire protocol that would let a relay multiplex several concurrent
//! tunnels over one already-established relay-server registration
//! connection is exactly the kind of per-connection application protocol
//! spec §1 scopes out as an external collaborator — the same way the
//! DHT's remote-query wire protocol is out of scope in `dht.rs`. This
//! implementation instead gives each tunnel request its own dedicated TCP
//! leg: bridging a tunnel consumes the target's *current* relay-server
//! registration connection, splicing it byte-for-byte to the requester's
//! tunnel socket and removing it from the registry. A relayed peer that
//! wants to stay reachable for further tunnels must re-register after
//! each use. This is a documented Open Question resolution — see
//! DESIGN.md.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::interval;

use crate::config::NodeConfig;
use crate::dht::DhtManager;
use crate::endpoint::Endpoint;
use crate::error::CoreError;
use crate::handshake::{self, InFlightSet};
use crate::ids::{NetworkId, PeerId};
use crate::registry::{ConnId, ConnectionRegistry, ConnectionSummary};

/// Client side (spec §4.8): never hold more relay-client connections than
/// this.
const RELAY_CLIENT_CAPACITY: usize = 3;
const RELAY_FILL_INTERVAL: Duration = Duration::from_secs(30);

const TUNNEL_ACCEPT: u8 = 0;
const TUNNEL_REJECT: u8 = 1;

/// This node's own outbound "relay-client" connections: up to
/// `RELAY_CLIENT_CAPACITY` connections to remote relays, offloading this
/// node's own reachability to them.
pub struct RelayClientPool {
    cfg: NodeConfig,
    registry: Arc<ConnectionRegistry>,
    dht: Arc<DhtManager>,
    local_peer_id: PeerId,
    in_flight: InFlightSet<Endpoint>,
    members: Mutex<Vec<ConnId>>,
}

impl RelayClientPool {
    pub fn new(
        cfg: NodeConfig,
        registry: Arc<ConnectionRegistry>,
        dht: Arc<DhtManager>,
        local_peer_id: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            registry,
            dht,
            local_peer_id,
            in_flight: InFlightSet::new(),
            members: Mutex::new(Vec::new()),
        })
    }

    pub fn client_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Runs until the task is dropped/aborted: tops up the relay-client
    /// list every 30 s.
    pub async fn run_fill_timer(self: Arc<Self>) {
        let mut ticker = interval(RELAY_FILL_INTERVAL);
        loop {
            ticker.tick().await;
            self.fill_once().await;
        }
    }

    async fn fill_once(self: &Arc<Self>) {
        self.prune_disposed();
        let needed = RELAY_CLIENT_CAPACITY.saturating_sub(self.members.lock().len());
        if needed == 0 {
            return;
        }

        let candidates = self.dht.ipv4_node().sample_random_nodes(needed);
        if candidates.is_empty() {
            return;
        }

        let handles: Vec<_> = candidates
            .into_iter()
            .map(|endpoint| {
                let this = self.clone();
                tokio::spawn(async move { this.dial_and_register(endpoint).await })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn prune_disposed(&self) {
        let mut members = self.members.lock();
        members.retain(|id| self.registry.is_attached(*id));
    }

    /// Dial `endpoint` and, on success, atomically insert into the
    /// relay-client list if still under capacity — over-capacity wins are
    /// discarded, per spec §4.8.
    async fn dial_and_register(self: &Arc<Self>, endpoint: Endpoint) {
        let summary = match handshake::make_connection(
            &self.cfg,
            &self.registry,
            &self.in_flight,
            self.local_peer_id,
            endpoint.clone(),
        )
        .await
        {
            Ok(summary) => summary,
            Err(e) => {
                log::debug!("relay-client dial to {endpoint:?} failed: {e}");
                return;
            }
        };

        let mut members = self.members.lock();
        if members.len() >= RELAY_CLIENT_CAPACITY {
            drop(members);
            self.registry.dispose_by_id(summary.id);
            return;
        }
        members.push(summary.id);
        drop(members);
        self.registry.set_relay_client_mode(summary.id, true);
    }
}

/// Server side (spec §4.8): which currently-registered connections are
/// hosting which networks on this node's behalf, plus the DHT announce
/// this triggers so prospective peers can discover this node as a relay
/// for that network.
pub struct RelayServerNetworkMap {
    dht: Arc<DhtManager>,
    local_service_port: u16,
    networks: Mutex<HashMap<NetworkId, Vec<ConnId>>>,
}

impl RelayServerNetworkMap {
    pub fn new(dht: Arc<DhtManager>, local_service_port: u16) -> Arc<Self> {
        Arc::new(Self {
            dht,
            local_service_port,
            networks: Mutex::new(HashMap::new()),
        })
    }

    /// Record that `conn_id` wants to be relayed for `network_id`. The
    /// first registration for a given network triggers
    /// `beginAnnounce(networkId, false, (0.0.0.0, localPort))` so
    /// prospective peers can discover this node as a relay for it.
    pub async fn register(self: &Arc<Self>, network_id: NetworkId, conn_id: ConnId) {
        let is_new_network = {
            let mut networks = self.networks.lock();
            let existed = networks.contains_key(&network_id);
            let members = networks.entry(network_id.clone()).or_default();
            if !members.contains(&conn_id) {
                members.push(conn_id);
            }
            !existed
        };
        if is_new_network {
            let self_endpoint = Endpoint::V4(Ipv4Addr::UNSPECIFIED, self.local_service_port);
            self.dht.begin_announce(network_id, false, self_endpoint, |_, _| {}).await;
        }
    }

    /// Unregister `conn_id` from every network it was hosting. Spec:
    /// "disposal ... must remove the record from both maps ... before
    /// signaling stream close."
    pub fn on_connection_disposed(&self, conn_id: ConnId) {
        let mut networks = self.networks.lock();
        networks.retain(|_, members| {
            members.retain(|id| *id != conn_id);
            !members.is_empty()
        });
    }

    /// How many registered connections currently host `network_id`.
    pub fn member_count(&self, network_id: &NetworkId) -> usize {
        self.networks.lock().get(network_id).map(Vec::len).unwrap_or(0)
    }
}

/// Server side: a relay tunnel-request (handshake version `2`, accepted by
/// `handshake::accept` as `Accepted::TunnelRequest`) named `target`. Bridge
/// it to `target`'s current registered connection by splicing the two TCP
/// streams together until either side closes.
///
/// Consumes `target`'s existing connection: see the module doc comment for
/// why this implementation does not multiplex further tunnels over it.
pub async fn handle_tunnel_request(
    mut stream: TcpStream,
    target: PeerId,
    registry: &ConnectionRegistry,
    network_map: &RelayServerNetworkMap,
) -> Result<(), CoreError> {
    let Some(summary) = registry.find_by_peer_id(&target) else {
        let _ = stream.write_all(&[TUNNEL_REJECT]).await;
        return Err(CoreError::Unreachable(format!("no connection to bridge for {target}")));
    };
    let Some(mut record) = registry.dispose_by_id(summary.id) else {
        let _ = stream.write_all(&[TUNNEL_REJECT]).await;
        return Err(CoreError::Unreachable(format!("connection to {target} disappeared before bridging")));
    };
    network_map.on_connection_disposed(summary.id);

    stream.write_all(&[TUNNEL_ACCEPT]).await.map_err(CoreError::Io)?;
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut *record.stream).await;
    Ok(())
}

/// Client side: dial a peer that is only reachable through
/// `relay_endpoint` by sending a tunnel-request naming `target`, then
/// running the normal version-1 handshake over the bridged stream (spec
/// §4.8). The resulting registry entry is flagged `isVirtual=true`.
///
/// Coalesces concurrent callers the same way `handshake::make_connection`
/// does for real dials, keyed by `target` rather than by endpoint, since
/// several relays might all be asked to bridge to the same peer at once.
pub async fn make_virtual_connection(
    cfg: &NodeConfig,
    registry: &ConnectionRegistry,
    in_flight: &InFlightSet<PeerId>,
    local_peer_id: PeerId,
    relay_endpoint: Endpoint,
    target: PeerId,
) -> Result<ConnectionSummary, CoreError> {
    if let Some(existing) = registry.find_by_peer_id(&target) {
        return Ok(existing);
    }

    if !in_flight.try_begin(target) {
        if !in_flight.wait(&target, cfg.connect_timeout_internet).await {
            return Err(CoreError::ConnectInProgress(socket_addr_or_unspecified(&relay_endpoint)));
        }
        return registry
            .find_by_peer_id(&target)
            .ok_or_else(|| CoreError::ConnectInProgress(socket_addr_or_unspecified(&relay_endpoint)));
    }

    let result = dial_virtual(cfg, registry, local_peer_id, relay_endpoint.clone(), target).await;
    in_flight.finish(&target);
    result
}

async fn dial_virtual(
    cfg: &NodeConfig,
    registry: &ConnectionRegistry,
    local_peer_id: PeerId,
    relay_endpoint: Endpoint,
    target: PeerId,
) -> Result<ConnectionSummary, CoreError> {
    let tunnel_stream = handshake::initiate_tunnel_request(cfg, &relay_endpoint, target).await?;
    handshake::initiate_virtual(tunnel_stream, relay_endpoint, local_peer_id, cfg.service_port, registry).await
}

fn socket_addr_or_unspecified(endpoint: &Endpoint) -> std::net::SocketAddr {
    endpoint
        .to_socket_addr()
        .unwrap_or_else(|| std::net::SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionRecord;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    fn network(n: u8) -> NetworkId {
        NetworkId::from_bytes(vec![n; 20]).unwrap()
    }

    #[tokio::test]
    async fn fill_once_dials_a_sampled_endpoint_and_enters_relay_client_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_registry = Arc::new(ConnectionRegistry::new(peer(1)));
        let server_registry_clone = server_registry.clone();
        tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            let _ = handshake::accept(stream, remote_addr, peer(1), &server_registry_clone).await;
        });

        let cfg = NodeConfig::default();
        let client_registry = Arc::new(ConnectionRegistry::new(peer(2)));
        let dht = DhtManager::new(cfg.clone(), None, client_registry.clone(), peer(2));
        let endpoint = Endpoint::from_socket_addr(addr);
        dht.ipv4_node().seed([endpoint]);

        let pool = RelayClientPool::new(cfg, client_registry.clone(), dht, peer(2));
        pool.clone().fill_once().await;

        assert_eq!(pool.client_count(), 1);
        assert_eq!(client_registry.len(), 1);
    }

    #[tokio::test]
    async fn fill_once_is_a_no_op_once_at_capacity() {
        let cfg = NodeConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(peer(1)));
        let dht = DhtManager::new(cfg.clone(), None, registry.clone(), peer(1));
        dht.ipv4_node().seed([Endpoint::V4(Ipv4Addr::new(9, 9, 9, 9), 1)]);

        let pool = RelayClientPool::new(cfg, registry, dht, peer(1));
        *pool.members.lock() = vec![1, 2, 3];

        pool.clone().fill_once().await;
        assert_eq!(pool.client_count(), 3);
    }

    #[tokio::test]
    async fn registering_a_network_for_the_first_time_is_reported_as_new() {
        let cfg = NodeConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(peer(1)));
        let dht = DhtManager::new(cfg, None, registry, peer(1));
        let map = RelayServerNetworkMap::new(dht, 4000);
        let net = network(1);

        map.register(net.clone(), 100).await;
        assert_eq!(map.member_count(&net), 1);

        map.register(net.clone(), 200).await;
        assert_eq!(map.member_count(&net), 2);

        // re-registering the same connection id is a no-op.
        map.register(net.clone(), 100).await;
        assert_eq!(map.member_count(&net), 2);
    }

    #[tokio::test]
    async fn disposing_a_connection_prunes_it_from_every_network_and_drops_empty_entries() {
        let cfg = NodeConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(peer(1)));
        let dht = DhtManager::new(cfg, None, registry, peer(1));
        let map = RelayServerNetworkMap::new(dht, 4000);
        let net_a = network(1);
        let net_b = network(2);

        map.register(net_a.clone(), 1).await;
        map.register(net_b.clone(), 1).await;
        map.register(net_b.clone(), 2).await;

        map.on_connection_disposed(1);
        assert_eq!(map.member_count(&net_a), 0);
        assert_eq!(map.member_count(&net_b), 1);
    }

    #[tokio::test]
    async fn make_virtual_connection_reuses_an_already_registered_peer() {
        let cfg = NodeConfig::default();
        let registry = ConnectionRegistry::new(peer(1));
        let in_flight: InFlightSet<PeerId> = InFlightSet::new();
        let (a, _b) = tokio::io::duplex(64);
        let record = ConnectionRecord {
            peer_id: peer(9),
            remote_endpoint: Endpoint::V4(Ipv4Addr::new(1, 2, 3, 4), 4000),
            is_virtual: true,
            tcp_relay_client_mode: false,
            stream: Box::new(a),
        };
        registry.insert(record);

        let relay_endpoint = Endpoint::V4(Ipv4Addr::new(5, 6, 7, 8), 4000);
        let summary = make_virtual_connection(&cfg, &registry, &in_flight, peer(1), relay_endpoint, peer(9))
            .await
            .unwrap();
        assert_eq!(summary.peer_id, peer(9));
        assert!(summary.is_virtual);
    }

    /// Exercises the byte-splicing primitive `handle_tunnel_request` relies
    /// on: bytes written on the requester's tunnel socket arrive at the
    /// bridged target connection and vice versa.
    #[tokio::test]
    async fn handle_tunnel_request_bridges_requester_and_target_byte_streams() {
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        let target_side = tokio::spawn(async move {
            let (mut stream, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"world").await.unwrap();
            buf
        });
        let target_conn = TcpStream::connect(target_addr).await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new(peer(1)));
        let record = ConnectionRecord {
            peer_id: peer(9),
            remote_endpoint: Endpoint::from_socket_addr(target_addr),
            is_virtual: false,
            tcp_relay_client_mode: true,
            stream: Box::new(target_conn),
        };
        registry.insert(record);
        let cfg = NodeConfig::default();
        let dht = DhtManager::new(cfg, None, registry.clone(), peer(1));
        let network_map = RelayServerNetworkMap::new(dht, 4000);

        let requester_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let requester_addr = requester_listener.local_addr().unwrap();
        let registry_clone = registry.clone();
        let bridge_task = tokio::spawn(async move {
            let (stream, _) = requester_listener.accept().await.unwrap();
            handle_tunnel_request(stream, peer(9), &registry_clone, &network_map).await
        });

        let mut requester = TcpStream::connect(requester_addr).await.unwrap();
        let mut accept_byte = [0u8; 1];
        requester.read_exact(&mut accept_byte).await.unwrap();
        assert_eq!(accept_byte[0], TUNNEL_ACCEPT);

        requester.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        requester.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
        drop(requester);

        assert_eq!(&target_side.await.unwrap(), b"hello");
        assert!(bridge_task.await.unwrap().is_ok());
        assert!(registry.find_by_peer_id(&peer(9)).is_none());
    }
}
