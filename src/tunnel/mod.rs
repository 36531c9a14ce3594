//! Peer Manager.
//!
//! Owns the tunnel address pool and the set of active peers. A peer moves
//! `Unallocated -> Active -> Released`; releasing returns its address to the
//! pool and removes the key from the backend.
//!
//! ```text
//!   connect(key) ──▶ allocate address ──▶ backend.add_peer ──▶ Active
//!        ▲                                    │ error/timeout
//!        │                                    ▼
//!        │                           release address (rollback)
//!        │
//!   disconnect / revoke ──▶ backend.remove_peer ──▶ release address
//! ```

pub mod backend;
pub mod manager;
pub mod pool;

pub use backend::{BackendError, MemoryBackend, TunnelBackend, WgBackend};
pub use manager::{Peer, PeerError, PeerManager};
pub use pool::{AddressPool, NetworkError, TunnelNetwork};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const PEER_KEY_LENGTH: usize = 32;

/// A tunnel public key: 32 bytes, carried as standard base64.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerKey([u8; PEER_KEY_LENGTH]);

impl PeerKey {
    pub fn from_bytes(bytes: [u8; PEER_KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_KEY_LENGTH] {
        &self.0
    }
}

impl FromStr for PeerKey {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = STANDARD
            .decode(s.trim())
            .map_err(|e| PeerError::InvalidKey(format!("not base64: {}", e)))?;
        let bytes: [u8; PEER_KEY_LENGTH] = decoded.as_slice().try_into().map_err(|_| {
            PeerError::InvalidKey(format!(
                "expected {} bytes, got {}",
                PEER_KEY_LENGTH,
                decoded.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self)
    }
}

impl Serialize for PeerKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
