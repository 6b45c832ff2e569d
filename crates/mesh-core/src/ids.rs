//! Peer and network identifiers.

use std::fmt;

/// A 256-bit opaque peer identifier, generated uniformly at random at node
/// startup. Equality is bit-exact; there is no authenticity binding to a
/// key or certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Generate a new random peer id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A 160- or 256-bit identifier naming a hosted application network. Used
/// as the DHT key for "find peers in this network" and "announce self in
/// this network".
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NetworkId(Vec<u8>);

impl NetworkId {
    /// Construct from raw bytes; must be 20 (SHA-1 width) or 32 (SHA-256
    /// width) bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, NetworkIdError> {
        match bytes.len() {
            20 | 32 => Ok(NetworkId(bytes)),
            n => Err(NetworkIdError::BadLength(n)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NetworkId({})", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum NetworkIdError {
    #[error("network id must be 20 or 32 bytes, got {0}")]
    BadLength(usize),
}
