//! Top-level node wiring. Not its own spec component — this is the place
//! every C1–C9 component gets instantiated, spawned, and handed to callers
//! as one cohesive handle.
//!
//! Grounded on `core-mesh`'s `MeshNetwork` for the "one struct composes
//! every component and a single async entry point wires and spawns them"
//! shape, generalized into an `Arc<Inner>` + thin `Handle` split: `Inner`
//! owns every component and background task; `MeshNode` is the cheap,
//! cloneable handle callers hold, and dropping its last clone aborts every
//! spawned loop.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::dht::DhtManager;
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::CoreError;
use crate::handshake::{self, Accepted, InFlightSet};
use crate::ids::{NetworkId, PeerId};
use crate::overlay::{AnonymityOverlayAdapter, OverlayController, ProcessOverlayController};
use crate::reachability::{HttpWebProbe, ReachabilityManager, WebProbe};
use crate::registry::{ConnId, ConnectionRegistry, ConnectionSummary};
use crate::relay::{self, RelayClientPool, RelayServerNetworkMap};
use crate::transport::{self, DecoyRole};

struct Inner {
    cfg: NodeConfig,
    local_peer_id: PeerId,
    local_ipv4_addr: std::net::SocketAddr,
    local_ipv6_addr: std::net::SocketAddr,
    registry: Arc<ConnectionRegistry>,
    dht: Arc<DhtManager>,
    reachability: Arc<ReachabilityManager>,
    relay_client_pool: Arc<RelayClientPool>,
    relay_server_networks: Arc<RelayServerNetworkMap>,
    overlay: Option<Arc<AnonymityOverlayAdapter>>,
    real_in_flight: InFlightSet<Endpoint>,
    virtual_in_flight: InFlightSet<PeerId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// A cheap, cloneable handle to a running node. Every clone shares the same
/// components and background tasks; the node shuts down once the last
/// clone is dropped.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<Inner>,
}

impl MeshNode {
    /// Generate a fresh peer id, bring up every component named in the
    /// component map, and spawn every background loop. Fails only if the
    /// two internet-facing listeners cannot be bound — every other
    /// component degrades independently at runtime rather than failing
    /// startup (spec §7).
    pub async fn start(cfg: NodeConfig) -> Result<Self, CoreError> {
        let local_peer_id = PeerId::random();
        let registry = Arc::new(ConnectionRegistry::new(local_peer_id));

        let overlay = if cfg.overlay_enabled {
            let controller: Box<dyn OverlayController> =
                Box::new(ProcessOverlayController::new(cfg.overlay_controller_path.clone()));
            Some(Arc::new(AnonymityOverlayAdapter::new(cfg.service_port, controller)))
        } else {
            None
        };

        let overlay_bind_endpoint = match &overlay {
            Some(overlay) => match overlay.bring_up().await {
                Ok(endpoint) => Some(endpoint),
                Err(e) => {
                    log::warn!("anonymity overlay bring-up failed: {e}");
                    None
                }
            },
            None => None,
        };

        let dht = DhtManager::new(cfg.clone(), overlay_bind_endpoint, registry.clone(), local_peer_id);

        let probe: Box<dyn WebProbe> = Box::new(HttpWebProbe::new(&cfg));
        let reachability = Arc::new(ReachabilityManager::new(cfg.clone(), cfg.service_port, probe));

        let relay_client_pool = RelayClientPool::new(cfg.clone(), registry.clone(), dht.clone(), local_peer_id);
        let relay_server_networks = RelayServerNetworkMap::new(dht.clone(), cfg.service_port);

        let ipv4_listener = transport::listen(&Endpoint::V4(Ipv4Addr::UNSPECIFIED, cfg.service_port)).await?;
        let ipv6_listener = transport::listen(&Endpoint::V6(Ipv6Addr::UNSPECIFIED, cfg.service_port)).await?;
        let local_ipv4_addr = ipv4_listener.local_addr().map_err(CoreError::Io)?;
        let local_ipv6_addr = ipv6_listener.local_addr().map_err(CoreError::Io)?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_internet_accept_loop(
            ipv4_listener,
            registry.clone(),
            dht.clone(),
            relay_server_networks.clone(),
            local_peer_id,
            cfg.overlay_enabled,
        )));
        tasks.push(tokio::spawn(run_internet_accept_loop(
            ipv6_listener,
            registry.clone(),
            dht.clone(),
            relay_server_networks.clone(),
            local_peer_id,
            cfg.overlay_enabled,
        )));
        tasks.push(tokio::spawn(dht.clone().run_network_watcher()));
        tasks.push(tokio::spawn(dht.clone().fetch_and_dispatch_bootstrap()));
        tasks.push(tokio::spawn({
            let reachability = reachability.clone();
            async move { reachability.run_periodic().await }
        }));
        tasks.push(tokio::spawn(relay_client_pool.clone().run_fill_timer()));

        let inner = Arc::new(Inner {
            cfg,
            local_peer_id,
            local_ipv4_addr,
            local_ipv6_addr,
            registry,
            dht,
            reachability,
            relay_client_pool,
            relay_server_networks,
            overlay,
            real_in_flight: InFlightSet::new(),
            virtual_in_flight: InFlightSet::new(),
            tasks: Mutex::new(tasks),
        });

        Ok(Self { inner })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer_id
    }

    /// The IPv4 peer listener's actual bound address — distinct from
    /// `dht().ipv4_node().bind_endpoint()`, which only reflects the
    /// configured `service_port` and is wrong when that is `0`.
    pub fn local_ipv4_addr(&self) -> std::net::SocketAddr {
        self.inner.local_ipv4_addr
    }

    pub fn local_ipv6_addr(&self) -> std::net::SocketAddr {
        self.inner.local_ipv6_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn dht(&self) -> &Arc<DhtManager> {
        &self.inner.dht
    }

    pub fn reachability(&self) -> &Arc<ReachabilityManager> {
        &self.inner.reachability
    }

    pub fn relay_client_pool(&self) -> &Arc<RelayClientPool> {
        &self.inner.relay_client_pool
    }

    pub fn relay_server_networks(&self) -> &Arc<RelayServerNetworkMap> {
        &self.inner.relay_server_networks
    }

    pub fn peer_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Establish (or reuse) a direct connection to `endpoint` (spec §4.6).
    pub async fn connect(&self, endpoint: Endpoint) -> Result<ConnectionSummary, CoreError> {
        handshake::make_connection(
            &self.inner.cfg,
            &self.inner.registry,
            &self.inner.real_in_flight,
            self.inner.local_peer_id,
            endpoint,
        )
        .await
    }

    /// Establish (or reuse) a connection to `target` tunneled through
    /// `relay_endpoint` (spec §4.8).
    pub async fn connect_via_relay(
        &self,
        relay_endpoint: Endpoint,
        target: PeerId,
    ) -> Result<ConnectionSummary, CoreError> {
        relay::make_virtual_connection(
            &self.inner.cfg,
            &self.inner.registry,
            &self.inner.virtual_in_flight,
            self.inner.local_peer_id,
            relay_endpoint,
            target,
        )
        .await
    }

    pub async fn find_peers<F>(&self, network_id: NetworkId, local_only: bool, callback: F)
    where
        F: Fn(TransportKind, Vec<Endpoint>) + Send + Sync + 'static,
    {
        self.inner.dht.begin_find_peers(network_id, local_only, callback).await
    }

    pub async fn announce<F>(&self, network_id: NetworkId, local_only: bool, self_endpoint: Endpoint, callback: F)
    where
        F: Fn(TransportKind, Vec<Endpoint>) + Send + Sync + 'static,
    {
        self.inner.dht.begin_announce(network_id, local_only, self_endpoint, callback).await
    }

    /// Offer an existing connection as a relay-server leg for `network_id`
    /// (spec §4.8).
    pub async fn register_as_relay(&self, network_id: NetworkId, conn_id: ConnId) {
        self.inner.relay_server_networks.register(network_id, conn_id).await
    }

    /// Tear down the anonymity overlay controller; background loops stop
    /// when the last `MeshNode` clone is dropped.
    pub async fn shutdown(&self) {
        if let Some(overlay) = &self.inner.overlay {
            overlay.tear_down().await;
        }
    }
}

/// Internet-facing accept loop (spec §4.1/§4.6): streams arriving from a
/// public address run the HTTP decoy server role before the version-byte
/// demux; streams from a private/loopback address skip it, symmetric to the
/// client's `use_http_decoy` gate in `handshake.rs` and to `local_dht.rs`'s
/// LAN accept loop (which never wraps the decoy at all).
async fn run_internet_accept_loop(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    dht: Arc<DhtManager>,
    relay_server_networks: Arc<RelayServerNetworkMap>,
    local_peer_id: PeerId,
    overlay_enabled: bool,
) {
    loop {
        let (mut stream, remote_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                log::warn!("peer listener accept failed: {e}");
                continue;
            }
        };
        let registry = registry.clone();
        let dht = dht.clone();
        let relay_server_networks = relay_server_networks.clone();
        tokio::spawn(async move {
            let remote_kind = Endpoint::from_socket_addr(remote_addr).kind(overlay_enabled);
            if matches!(remote_kind, TransportKind::IPv4Internet | TransportKind::IPv6Internet) {
                if let Err(e) = transport::wrap_http_decoy(&mut stream, DecoyRole::Server).await {
                    log::debug!("HTTP decoy from {remote_addr} aborted: {e}");
                    return;
                }
            }
            match handshake::accept(stream, remote_addr, local_peer_id, &registry).await {
                Ok(Accepted::Peer(_)) => {}
                Ok(Accepted::DhtChannel(dht_stream)) => {
                    let remote_endpoint = Endpoint::from_socket_addr(remote_addr);
                    if let Err(e) = dht.accept_internet_dht_connection(dht_stream, remote_endpoint) {
                        log::debug!("DHT channel from {remote_addr} rejected: {e}");
                    }
                }
                Ok(Accepted::TunnelRequest(tunnel_stream, target)) => {
                    if let Err(e) =
                        relay::handle_tunnel_request(tunnel_stream, target, &registry, &relay_server_networks).await
                    {
                        log::debug!("tunnel request for {target} failed: {e}");
                    }
                }
                Err(e) => log::debug!("handshake from {remote_addr} failed: {e}"),
            }
        });
    }
}
