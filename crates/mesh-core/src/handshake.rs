//! Handshake protocol (C6): the versioned peer-connection handshake, the
//! demux shunt to the DHT channel, crossed-connect convergence, and
//! per-endpoint connection-attempt coalescing.
//!
//! Every peer stream begins with one version byte. `0` is a demux shunt —
//! the rest of the stream belongs to the DHT manager (§4.4), not here. `1`
//! starts the peer handshake described below (spec §4.6). `2` is a relay
//! tunnel-request (spec §4.8, implemented in `relay.rs`): the rest of the
//! stream belongs to the relay coordinator, not here.

use std::collections::HashSet;
use std::hash::Hash;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};

use crate::config::NodeConfig;
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::CoreError;
use crate::ids::PeerId;
use crate::registry::{
    ConnectionDescriptor, ConnectionRecord, ConnectionRegistry, ConnectionSummary, InsertResult,
    RejectReason, ReserveResult,
};
use crate::transport::{self, DecoyRole};

/// Applied to a connection once the handshake completes, either side.
pub const PERSISTENT_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const PERSISTENT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Ordering heuristic for crossed-connect convergence (§4.6): not a
/// correctness requirement, just gives the peer-initiated handshake on the
/// other socket time to finish its own registry insert first.
const CROSSED_CONNECT_SLEEP: Duration = Duration::from_millis(500);

const PROTOCOL_VERSION_DHT: u8 = 0;
const PROTOCOL_VERSION_PEER: u8 = 1;
const PROTOCOL_VERSION_TUNNEL_REQUEST: u8 = 2;

const RESPONSE_ACCEPT: u8 = 0;
const RESPONSE_CANCEL: u8 = 1;

/// What an accepting server does once the version byte is known.
pub enum Accepted {
    /// Version `0`: hand the stream to the DHT manager.
    DhtChannel(TcpStream),
    /// Version `1`: the peer handshake completed and the connection is
    /// now in the registry.
    Peer(ConnectionSummary),
    /// Version `2`: a relay tunnel-request naming the peer it wants
    /// bridged to. Hand the stream and the target to the relay
    /// coordinator.
    TunnelRequest(TcpStream, PeerId),
}

/// Client side of the peer handshake. `stream` must already be connected
/// to `remote_endpoint`; on success the stream has been consumed into the
/// registry as the returned summary's backing connection.
pub async fn initiate(
    stream: TcpStream,
    remote_endpoint: Endpoint,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: &ConnectionRegistry,
) -> Result<ConnectionSummary, CoreError> {
    initiate_inner(stream, remote_endpoint, local_peer_id, local_service_port, registry, false).await
}

/// Same as `initiate`, but the resulting registry entry is flagged
/// `isVirtual=true` (spec §4.8) — used once a relay tunnel-request has
/// been accepted and the tunneled stream is about to run this same
/// version-1 exchange with the peer on the other end of the tunnel.
pub async fn initiate_virtual(
    stream: TcpStream,
    remote_endpoint: Endpoint,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: &ConnectionRegistry,
) -> Result<ConnectionSummary, CoreError> {
    initiate_inner(stream, remote_endpoint, local_peer_id, local_service_port, registry, true).await
}

async fn initiate_inner(
    mut stream: TcpStream,
    remote_endpoint: Endpoint,
    local_peer_id: PeerId,
    local_service_port: u16,
    registry: &ConnectionRegistry,
    is_virtual: bool,
) -> Result<ConnectionSummary, CoreError> {
    let mut hello = Vec::with_capacity(1 + 32 + 2);
    hello.push(PROTOCOL_VERSION_PEER);
    hello.extend_from_slice(local_peer_id.as_bytes());
    hello.extend_from_slice(&local_service_port.to_le_bytes());
    stream.write_all(&hello).await.map_err(CoreError::Io)?;
    stream.flush().await.map_err(CoreError::Io)?;

    let mut code = [0u8; 1];
    stream.read_exact(&mut code).await.map_err(CoreError::Io)?;
    let mut remote_id_bytes = [0u8; 32];
    stream.read_exact(&mut remote_id_bytes).await.map_err(CoreError::Io)?;
    let remote_peer_id = PeerId::from_bytes(remote_id_bytes);

    match code[0] {
        RESPONSE_ACCEPT => {
            let candidate = ConnectionRecord {
                peer_id: remote_peer_id,
                remote_endpoint: remote_endpoint.clone(),
                is_virtual,
                tcp_relay_client_mode: false,
                stream: Box::new(stream),
            };
            match registry.insert(candidate) {
                (InsertResult::Inserted(summary), _disposed) => Ok(summary),
                (InsertResult::Rejected { reason: RejectReason::SelfConnection, .. }, _) => {
                    Err(CoreError::SelfConnection)
                }
                (InsertResult::Rejected { reason, .. }, _) => {
                    // DuplicateVirtual, DuplicateReal, or a concurrent
                    // reservation: someone else's record should already (or
                    // will shortly) be visible — resolve by lookup.
                    let _ = reason;
                    lookup_existing(registry, &remote_endpoint, &remote_peer_id).ok_or_else(|| {
                        CoreError::DuplicateNotReconciled(socket_addr_or_unspecified(&remote_endpoint))
                    })
                }
            }
        }
        RESPONSE_CANCEL => {
            sleep(CROSSED_CONNECT_SLEEP).await;
            lookup_existing(registry, &remote_endpoint, &remote_peer_id)
                .ok_or_else(|| CoreError::DuplicateRejected(socket_addr_or_unspecified(&remote_endpoint)))
        }
        other => Err(CoreError::BadHandshake(format!("unexpected response code {other}"))),
    }
}

fn lookup_existing(
    registry: &ConnectionRegistry,
    endpoint: &Endpoint,
    peer_id: &PeerId,
) -> Option<ConnectionSummary> {
    registry.find_by_endpoint(endpoint).or_else(|| registry.find_by_peer_id(peer_id))
}

fn socket_addr_or_unspecified(endpoint: &Endpoint) -> SocketAddr {
    endpoint
        .to_socket_addr()
        .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0))
}

/// Server side: read the version byte and either hand the stream to the
/// DHT manager or run the peer handshake.
pub async fn accept(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    local_peer_id: PeerId,
    registry: &ConnectionRegistry,
) -> Result<Accepted, CoreError> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await.map_err(CoreError::Io)?;

    match version[0] {
        PROTOCOL_VERSION_DHT => Ok(Accepted::DhtChannel(stream)),
        PROTOCOL_VERSION_PEER => accept_peer(stream, remote_addr, local_peer_id, registry).await,
        PROTOCOL_VERSION_TUNNEL_REQUEST => accept_tunnel_request(stream).await,
        other => Err(CoreError::UnsupportedProtocolVersion(other)),
    }
}

/// Version `2`: read the 32-byte target peer id and hand the raw stream
/// back to the caller. The relay coordinator owns everything from here —
/// accepting or rejecting the tunnel and splicing it to the target's
/// existing connection (spec §4.8).
async fn accept_tunnel_request(mut stream: TcpStream) -> Result<Accepted, CoreError> {
    let mut target_bytes = [0u8; 32];
    stream.read_exact(&mut target_bytes).await.map_err(CoreError::Io)?;
    Ok(Accepted::TunnelRequest(stream, PeerId::from_bytes(target_bytes)))
}

/// Client side of a tunnel-request: dial `relay_endpoint`, send the
/// version-2 preamble naming `target`, and return the stream if the relay
/// accepted. The caller then runs the normal version-1 handshake
/// (`initiate`) over the returned stream to reach `target`.
pub async fn initiate_tunnel_request(
    cfg: &NodeConfig,
    relay_endpoint: &Endpoint,
    target: PeerId,
) -> Result<TcpStream, CoreError> {
    let kind = relay_endpoint.kind(cfg.overlay_enabled);
    let mut stream = transport::connect(cfg, kind, relay_endpoint).await?;

    let mut preamble = Vec::with_capacity(1 + 32);
    preamble.push(PROTOCOL_VERSION_TUNNEL_REQUEST);
    preamble.extend_from_slice(target.as_bytes());
    stream.write_all(&preamble).await.map_err(CoreError::Io)?;
    stream.flush().await.map_err(CoreError::Io)?;

    let mut code = [0u8; 1];
    stream.read_exact(&mut code).await.map_err(CoreError::Io)?;
    match code[0] {
        RESPONSE_ACCEPT => Ok(stream),
        RESPONSE_CANCEL => Err(CoreError::Unreachable(format!("relay at {relay_endpoint:?} could not bridge to {target}"))),
        other => Err(CoreError::BadHandshake(format!("unexpected tunnel-request response code {other}"))),
    }
}

async fn accept_peer(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    local_peer_id: PeerId,
    registry: &ConnectionRegistry,
) -> Result<Accepted, CoreError> {
    let mut remote_id_bytes = [0u8; 32];
    stream.read_exact(&mut remote_id_bytes).await.map_err(CoreError::Io)?;
    let remote_peer_id = PeerId::from_bytes(remote_id_bytes);

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await.map_err(CoreError::Io)?;
    let remote_service_port = u16::from_le_bytes(port_bytes);
    // The inbound ephemeral port is not a reachable address; rewrite it to
    // the peer's advertised service port.
    let remote_endpoint = Endpoint::from_socket_addr(remote_addr).with_port(remote_service_port);

    let descriptor = ConnectionDescriptor {
        peer_id: remote_peer_id,
        remote_endpoint: remote_endpoint.clone(),
        is_virtual: false,
        tcp_relay_client_mode: false,
    };

    let (reserve_result, disposed) = registry.reserve(descriptor);
    drop(disposed); // closes any evicted stale streams

    match reserve_result {
        ReserveResult::Reserved(id) => {
            let mut response = Vec::with_capacity(1 + 32);
            response.push(RESPONSE_ACCEPT);
            response.extend_from_slice(local_peer_id.as_bytes());
            if let Err(e) = stream.write_all(&response).await {
                registry.abort_reservation(id);
                return Err(CoreError::Io(e));
            }
            let summary = registry.attach(id, Box::new(stream));
            Ok(Accepted::Peer(summary))
        }
        ReserveResult::Rejected { reason, .. } => {
            let mut response = Vec::with_capacity(1 + 32);
            response.push(RESPONSE_CANCEL);
            response.extend_from_slice(local_peer_id.as_bytes());
            let _ = stream.write_all(&response).await;
            Err(reject_reason_to_error(reason, remote_peer_id, &remote_endpoint))
        }
    }
}

fn reject_reason_to_error(reason: RejectReason, peer_id: PeerId, endpoint: &Endpoint) -> CoreError {
    match reason {
        RejectReason::SelfConnection => CoreError::SelfConnection,
        RejectReason::DuplicateVirtual => CoreError::DuplicateVirtual(peer_id),
        RejectReason::DuplicateReal => CoreError::DuplicateReal(peer_id),
        RejectReason::ReservationInProgress => CoreError::ConnectInProgress(socket_addr_or_unspecified(endpoint)),
    }
}

/// A set of keys currently being dialed, used to coalesce concurrent
/// `make_connection` calls onto a single in-flight attempt (spec §4.6). A
/// second `InFlightSet<PeerId>` instance covers virtual (tunneled) dials
/// the same way (relay.rs).
pub struct InFlightSet<K: Eq + Hash + Clone> {
    inner: Mutex<HashSet<K>>,
    notify: Notify,
}

impl<K: Eq + Hash + Clone> Default for InFlightSet<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> InFlightSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to become the sole owner of an in-flight dial to `key`. Returns
    /// `true` if this caller won and must call `finish` when done.
    pub(crate) fn try_begin(&self, key: K) -> bool {
        self.inner.lock().insert(key)
    }

    pub(crate) fn finish(&self, key: &K) {
        self.inner.lock().remove(key);
        self.notify.notify_waiters();
    }

    /// Wait until `key` is no longer in flight, or `budget` elapses.
    /// Returns `false` on timeout — callers then fail with
    /// `CoreError::ConnectInProgress`.
    pub(crate) async fn wait(&self, key: &K, budget: Duration) -> bool {
        let deadline = Instant::now() + budget;
        loop {
            let notified = self.notify.notified();
            if !self.inner.lock().contains(key) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }
}

/// Establish (or reuse) a connection to `endpoint`: return the existing
/// record if one is already registered, wait on an in-flight dial to the
/// same endpoint if one is underway, or dial and handshake a new one.
pub async fn make_connection(
    cfg: &NodeConfig,
    registry: &ConnectionRegistry,
    in_flight: &InFlightSet<Endpoint>,
    local_peer_id: PeerId,
    endpoint: Endpoint,
) -> Result<ConnectionSummary, CoreError> {
    if let Some(existing) = registry.find_by_endpoint(&endpoint) {
        return Ok(existing);
    }

    let kind = endpoint.kind(cfg.overlay_enabled);
    let budget = connect_budget(cfg, kind);

    if !in_flight.try_begin(endpoint.clone()) {
        if !in_flight.wait(&endpoint, budget).await {
            return Err(CoreError::ConnectInProgress(socket_addr_or_unspecified(&endpoint)));
        }
        // The winner's result is not shared; re-check registry state.
        return registry
            .find_by_endpoint(&endpoint)
            .ok_or_else(|| CoreError::ConnectInProgress(socket_addr_or_unspecified(&endpoint)));
    }

    let result = dial_and_handshake(cfg, registry, local_peer_id, kind, endpoint.clone()).await;
    in_flight.finish(&endpoint);
    result
}

fn connect_budget(cfg: &NodeConfig, kind: TransportKind) -> Duration {
    match kind {
        TransportKind::LocalNetwork => cfg.connect_timeout_lan,
        TransportKind::AnonymityOverlay => cfg.connect_timeout_overlay,
        TransportKind::IPv4Internet | TransportKind::IPv6Internet => cfg.connect_timeout_internet,
    }
}

async fn dial_and_handshake(
    cfg: &NodeConfig,
    registry: &ConnectionRegistry,
    local_peer_id: PeerId,
    kind: TransportKind,
    endpoint: Endpoint,
) -> Result<ConnectionSummary, CoreError> {
    let mut stream = transport::connect(cfg, kind, &endpoint).await?;
    if use_http_decoy(kind, cfg) {
        transport::wrap_http_decoy(&mut stream, DecoyRole::Client).await?;
    }
    initiate(stream, endpoint, local_peer_id, cfg.service_port, registry).await
}

/// The HTTP decoy only makes sense dialing the open internet directly — a
/// proxy or the anonymity overlay already provides its own cover traffic.
fn use_http_decoy(kind: TransportKind, cfg: &NodeConfig) -> bool {
    matches!(kind, TransportKind::IPv4Internet | TransportKind::IPv6Internet) && cfg.proxy.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn successful_handshake_inserts_both_sides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_registry = std::sync::Arc::new(ConnectionRegistry::new(peer(1)));
        let client_registry = ConnectionRegistry::new(peer(2));

        let server_registry_clone = server_registry.clone();
        let server = tokio::spawn(async move {
            let (stream, remote_addr) = listener.accept().await.unwrap();
            let outcome = accept(stream, remote_addr, peer(1), &server_registry_clone).await;
            matches!(outcome, Ok(Accepted::Peer(_)))
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let remote_endpoint = Endpoint::from_socket_addr(addr);
        let summary = initiate(client_stream, remote_endpoint, peer(2), 4000, &client_registry)
            .await
            .unwrap();
        assert_eq!(summary.peer_id, peer(1));

        let accepted_ok = server.await.unwrap();
        assert!(accepted_ok);
        assert_eq!(server_registry.len(), 1);
        assert_eq!(client_registry.len(), 1);
    }

    #[tokio::test]
    async fn version_zero_is_handed_to_dht_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ConnectionRegistry::new(peer(1));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0u8]).await.unwrap();

        let (stream, remote_addr) = listener.accept().await.unwrap();
        let outcome = accept(stream, remote_addr, peer(1), &registry).await.unwrap();
        assert!(matches!(outcome, Accepted::DhtChannel(_)));
    }

    #[tokio::test]
    async fn unsupported_version_byte_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = ConnectionRegistry::new(peer(1));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[7u8]).await.unwrap();

        let (stream, remote_addr) = listener.accept().await.unwrap();
        let outcome = accept(stream, remote_addr, peer(1), &registry).await;
        assert!(matches!(outcome, Err(CoreError::UnsupportedProtocolVersion(7))));
    }

    #[tokio::test]
    async fn make_connection_reuses_an_already_registered_endpoint() {
        let cfg = NodeConfig::default();
        let registry = ConnectionRegistry::new(peer(1));
        let in_flight: InFlightSet<Endpoint> = InFlightSet::new();
        let endpoint = Endpoint::V4(Ipv4Addr::new(9, 9, 9, 9), 1234);

        let (a, _b) = tokio::io::duplex(64);
        let record = ConnectionRecord {
            peer_id: peer(5),
            remote_endpoint: endpoint.clone(),
            is_virtual: false,
            tcp_relay_client_mode: false,
            stream: Box::new(a),
        };
        registry.insert(record);

        let summary = make_connection(&cfg, &registry, &in_flight, peer(1), endpoint)
            .await
            .unwrap();
        assert_eq!(summary.peer_id, peer(5));
    }

    #[tokio::test]
    async fn in_flight_set_coalesces_concurrent_waiters() {
        let set = std::sync::Arc::new(InFlightSet::<Endpoint>::new());
        let ep = Endpoint::V4(Ipv4Addr::new(1, 1, 1, 1), 1);
        assert!(set.try_begin(ep.clone()));
        assert!(!set.try_begin(ep.clone()));

        let set_clone = set.clone();
        let ep_clone = ep.clone();
        let waiter = tokio::spawn(async move { set_clone.wait(&ep_clone, Duration::from_secs(1)).await });

        // Give the waiter a moment to register interest, then release.
        sleep(Duration::from_millis(20)).await;
        set.finish(&ep);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn in_flight_wait_times_out_if_never_finished() {
        let set: InFlightSet<Endpoint> = InFlightSet::new();
        let ep = Endpoint::V4(Ipv4Addr::new(2, 2, 2, 2), 1);
        assert!(set.try_begin(ep.clone()));

        let woke = set.wait(&ep, Duration::from_millis(30)).await;
        assert!(!woke);
    }
}
