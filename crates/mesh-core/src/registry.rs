//! Connection registry (C5): the dedup tables keyed by endpoint and by
//! peer id, and the virtual-vs-real arbitration run by the handshake once
//! a remote peer id is known.
//!
//! Insertion is two-phase — `reserve` then `attach` — so a caller that must
//! perform I/O on its stream (the handshake server writing its
//! accept/cancel response) between deciding the outcome and owning the
//! slot for good never does that I/O while holding the lock. `insert` is
//! the one-phase convenience for callers (the handshake client) that
//! already finished all their I/O before arbitration runs. One lock covers
//! both maps; it is held only for map bookkeeping, never across I/O.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::endpoint::Endpoint;
use crate::ids::PeerId;

/// Anything a connection record can hold as its transport: a direct TCP
/// stream or a tunneled virtual stream (relay.rs). Registry logic never
/// needs to know which.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type ConnId = u64;

/// A fully-formed connection, stream included — either a candidate being
/// inserted in one shot, or an existing record handed back for disposal.
pub struct ConnectionRecord {
    pub peer_id: PeerId,
    pub remote_endpoint: Endpoint,
    pub is_virtual: bool,
    pub tcp_relay_client_mode: bool,
    pub stream: Box<dyn PeerStream>,
}

/// The same fields, without a stream — what arbitration needs to run
/// before a stream necessarily exists as a registry-owned value.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub peer_id: PeerId,
    pub remote_endpoint: Endpoint,
    pub is_virtual: bool,
    pub tcp_relay_client_mode: bool,
}

impl From<&ConnectionRecord> for ConnectionDescriptor {
    fn from(r: &ConnectionRecord) -> Self {
        ConnectionDescriptor {
            peer_id: r.peer_id,
            remote_endpoint: r.remote_endpoint.clone(),
            is_virtual: r.is_virtual,
            tcp_relay_client_mode: r.tcp_relay_client_mode,
        }
    }
}

/// A cheap, stream-less snapshot of a confirmed `ConnectionRecord`.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub id: ConnId,
    pub peer_id: PeerId,
    pub remote_endpoint: Endpoint,
    pub is_virtual: bool,
    pub tcp_relay_client_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    SelfConnection,
    DuplicateVirtual,
    DuplicateReal,
    /// A reservation for the same endpoint or peer id is mid-handshake on
    /// another task; neither attached nor evictable yet.
    ReservationInProgress,
}

pub enum InsertResult {
    Inserted(ConnectionSummary),
    Rejected {
        reason: RejectReason,
        candidate: ConnectionRecord,
    },
}

pub enum ReserveResult {
    Reserved(ConnId),
    Rejected {
        reason: RejectReason,
        descriptor: ConnectionDescriptor,
    },
}

/// A slot in the tables: reserved immediately, stream attached once the
/// owning task finishes whatever I/O gated acceptance.
struct Slot {
    peer_id: PeerId,
    remote_endpoint: Endpoint,
    is_virtual: bool,
    tcp_relay_client_mode: bool,
    stream: Option<Box<dyn PeerStream>>,
}

impl Slot {
    fn summary(&self, id: ConnId) -> ConnectionSummary {
        ConnectionSummary {
            id,
            peer_id: self.peer_id,
            remote_endpoint: self.remote_endpoint.clone(),
            is_virtual: self.is_virtual,
            tcp_relay_client_mode: self.tcp_relay_client_mode,
        }
    }

    fn into_record(self) -> Option<ConnectionRecord> {
        self.stream.map(|stream| ConnectionRecord {
            peer_id: self.peer_id,
            remote_endpoint: self.remote_endpoint,
            is_virtual: self.is_virtual,
            tcp_relay_client_mode: self.tcp_relay_client_mode,
            stream,
        })
    }
}

#[derive(Default)]
struct Tables {
    next_id: ConnId,
    slots: HashMap<ConnId, Slot>,
    by_endpoint: HashMap<Endpoint, ConnId>,
    by_peer_id: HashMap<PeerId, ConnId>,
}

pub struct ConnectionRegistry {
    local_peer_id: PeerId,
    tables: Mutex<Tables>,
}

impl ConnectionRegistry {
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Run the insert-arbitration algorithm (spec §4.5) and reserve a slot
    /// for the winning descriptor, without requiring a stream yet. Returns
    /// any existing, already-attached records that were evicted — the
    /// caller closes their streams after this call returns.
    pub fn reserve(&self, descriptor: ConnectionDescriptor) -> (ReserveResult, Vec<ConnectionRecord>) {
        if descriptor.peer_id == self.local_peer_id {
            return (
                ReserveResult::Rejected {
                    reason: RejectReason::SelfConnection,
                    descriptor,
                },
                Vec::new(),
            );
        }

        let mut tables = self.tables.lock();
        let mut disposed = Vec::new();

        let collision = tables
            .by_endpoint
            .get(&descriptor.remote_endpoint)
            .copied()
            .or_else(|| tables.by_peer_id.get(&descriptor.peer_id).copied());

        if let Some(existing_id) = collision {
            match resolve_against_existing(&tables, existing_id, &descriptor) {
                Resolution::DisposeExisting => {
                    if let Some(record) = remove_slot(&mut tables, existing_id).into_record() {
                        disposed.push(record);
                    }
                }
                Resolution::RejectCandidate(reason) => {
                    return (ReserveResult::Rejected { reason, descriptor }, disposed)
                }
            }
        }

        let id = tables.next_id;
        tables.next_id += 1;
        tables.by_endpoint.insert(descriptor.remote_endpoint.clone(), id);
        tables.by_peer_id.insert(descriptor.peer_id, id);
        tables.slots.insert(
            id,
            Slot {
                peer_id: descriptor.peer_id,
                remote_endpoint: descriptor.remote_endpoint,
                is_virtual: descriptor.is_virtual,
                tcp_relay_client_mode: descriptor.tcp_relay_client_mode,
                stream: None,
            },
        );
        (ReserveResult::Reserved(id), disposed)
    }

    /// Attach a stream to a slot returned by `reserve`. Panics if `id` is
    /// not a currently-reserved slot — callers own the id exclusively
    /// between `reserve` and `attach`/`abort_reservation`.
    pub fn attach(&self, id: ConnId, stream: Box<dyn PeerStream>) -> ConnectionSummary {
        let mut tables = self.tables.lock();
        let slot = tables.slots.get_mut(&id).expect("attach called on a live reservation");
        slot.stream = Some(stream);
        slot.summary(id)
    }

    /// Give up a reservation that never got a stream attached (e.g. the
    /// handshake response write failed). Frees the slot for future
    /// candidates at the same endpoint or peer id.
    pub fn abort_reservation(&self, id: ConnId) {
        let mut tables = self.tables.lock();
        remove_slot(&mut tables, id);
    }

    /// One-shot insert for callers that already own a connected stream
    /// before arbitration runs (the handshake client, which has already
    /// finished the protocol exchange). Equivalent to `reserve` followed
    /// immediately by `attach`.
    pub fn insert(&self, candidate: ConnectionRecord) -> (InsertResult, Vec<ConnectionRecord>) {
        let descriptor = ConnectionDescriptor::from(&candidate);
        let ConnectionRecord { stream, .. } = candidate;

        match self.reserve(descriptor) {
            (ReserveResult::Reserved(id), disposed) => {
                let summary = self.attach(id, stream);
                (InsertResult::Inserted(summary), disposed)
            }
            (ReserveResult::Rejected { reason, descriptor }, disposed) => {
                let candidate = ConnectionRecord {
                    peer_id: descriptor.peer_id,
                    remote_endpoint: descriptor.remote_endpoint,
                    is_virtual: descriptor.is_virtual,
                    tcp_relay_client_mode: descriptor.tcp_relay_client_mode,
                    stream,
                };
                (InsertResult::Rejected { reason, candidate }, disposed)
            }
        }
    }

    /// Summary of an attached record at `endpoint`, if any. Reservations
    /// still awaiting `attach` are not visible here.
    pub fn find_by_endpoint(&self, endpoint: &Endpoint) -> Option<ConnectionSummary> {
        let tables = self.tables.lock();
        let id = *tables.by_endpoint.get(endpoint)?;
        let slot = tables.slots.get(&id)?;
        slot.stream.is_some().then(|| slot.summary(id))
    }

    /// Summary of an attached record for `peer_id`, if any.
    pub fn find_by_peer_id(&self, peer_id: &PeerId) -> Option<ConnectionSummary> {
        let tables = self.tables.lock();
        let id = *tables.by_peer_id.get(peer_id)?;
        let slot = tables.slots.get(&id)?;
        slot.stream.is_some().then(|| slot.summary(id))
    }

    /// Flip the relay-client-mode flag on an attached connection. Returns
    /// `false` if `id` no longer names a live, attached connection.
    pub fn set_relay_client_mode(&self, id: ConnId, enabled: bool) -> bool {
        let mut tables = self.tables.lock();
        match tables.slots.get_mut(&id) {
            Some(slot) if slot.stream.is_some() => {
                slot.tcp_relay_client_mode = enabled;
                true
            }
            _ => false,
        }
    }

    /// True iff `id` still names an attached (non-disposed) connection.
    pub fn is_attached(&self, id: ConnId) -> bool {
        self.tables.lock().slots.get(&id).is_some_and(|s| s.stream.is_some())
    }

    pub fn dispose_by_peer_id(&self, peer_id: &PeerId) -> Option<ConnectionRecord> {
        let mut tables = self.tables.lock();
        let id = *tables.by_peer_id.get(peer_id)?;
        remove_slot(&mut tables, id).into_record()
    }

    pub fn dispose_by_endpoint(&self, endpoint: &Endpoint) -> Option<ConnectionRecord> {
        let mut tables = self.tables.lock();
        let id = *tables.by_endpoint.get(endpoint)?;
        remove_slot(&mut tables, id).into_record()
    }

    pub fn dispose_by_id(&self, id: ConnId) -> Option<ConnectionRecord> {
        let mut tables = self.tables.lock();
        if !tables.slots.contains_key(&id) {
            return None;
        }
        remove_slot(&mut tables, id).into_record()
    }

    /// Number of attached (confirmed) connections, excluding in-flight
    /// reservations.
    pub fn len(&self) -> usize {
        self.tables.lock().slots.values().filter(|s| s.stream.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Resolution {
    DisposeExisting,
    RejectCandidate(RejectReason),
}

/// Shared virtual-vs-real rule used by the by-endpoint and by-peer-id
/// collision checks in `reserve`.
fn resolve_against_existing(
    tables: &Tables,
    existing_id: ConnId,
    candidate: &ConnectionDescriptor,
) -> Resolution {
    let existing = tables.slots.get(&existing_id).expect("indexed slot must exist");

    if existing.stream.is_none() {
        return Resolution::RejectCandidate(RejectReason::ReservationInProgress);
    }
    if existing.is_virtual && !candidate.is_virtual {
        return Resolution::DisposeExisting;
    }
    if candidate.is_virtual {
        return Resolution::RejectCandidate(RejectReason::DuplicateVirtual);
    }
    // Both real: by-endpoint collisions with two real connections at the
    // same endpoint are not reachable in practice (the registry would
    // already have rejected the first duplicate attempt), but resolve them
    // the same way as a by-peer-id collision rather than panicking.
    if allow_new_connection(&existing.remote_endpoint, &candidate.remote_endpoint) {
        Resolution::DisposeExisting
    } else {
        Resolution::RejectCandidate(RejectReason::DuplicateReal)
    }
}

/// True iff the new real connection should supersede the existing real one:
/// the address families must match, and the existing endpoint must not be
/// a private address — a public endpoint observed second supersedes a
/// stale private one.
fn allow_new_connection(existing_ep: &Endpoint, new_ep: &Endpoint) -> bool {
    let same_family = matches!(
        (existing_ep, new_ep),
        (Endpoint::V4(..), Endpoint::V4(..))
            | (Endpoint::V6(..), Endpoint::V6(..))
            | (Endpoint::Domain(..), Endpoint::Domain(..))
    );
    same_family && !existing_ep.is_private()
}

fn remove_slot(tables: &mut Tables, id: ConnId) -> Slot {
    let slot = tables.slots.remove(&id).expect("slot exists for indexed id");
    tables.by_endpoint.remove(&slot.remote_endpoint);
    tables.by_peer_id.remove(&slot.peer_id);
    slot
}
