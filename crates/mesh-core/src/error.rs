//! Crate-wide error kinds (spec §7).
//!
//! Background loops (accept, receive, watchers, timers) never propagate
//! these — they log and continue. Synchronous operations invoked by the
//! application (`make_connection`, `begin_find_peers`) surface them to the
//! caller.

use std::net::SocketAddr;

use crate::ids::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("HTTP decoy aborted before handshake completed")]
    DecoyAborted,

    #[error("handshake failed: {0}")]
    BadHandshake(String),

    #[error("unsupported protocol version byte {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("unsupported beacon version byte {0}")]
    UnsupportedBeaconVersion(u8),

    #[error("no DHT node handle for this address family")]
    UnsupportedFamily,

    #[error("refused connection to self")]
    SelfConnection,

    #[error("existing virtual connection to peer {0} kept over duplicate")]
    DuplicateVirtual(PeerId),

    #[error("existing real connection to peer {0} kept over duplicate")]
    DuplicateReal(PeerId),

    #[error("duplicate connection to {0:?} could not be reconciled with any existing record")]
    DuplicateNotReconciled(SocketAddr),

    #[error("handshake to {0:?} was cancelled and no crossed-connect record was found")]
    DuplicateRejected(SocketAddr),

    #[error("a connection attempt to {0:?} is already in flight")]
    ConnectInProgress(SocketAddr),

    #[error("component has been disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
