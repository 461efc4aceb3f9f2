//! Identity types for the relay tree
//!
//! Peer, session and owner identifiers are 64-bit for cheap copies and
//! compact registry documents. They render as fixed-width hex.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Peer identity - one per node process, immutable for its lifetime
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    pub const ZERO: PeerId = PeerId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        PeerId(id)
    }

    /// Generate a fresh random peer identity
    pub fn generate() -> Self {
        PeerId(rand::thread_rng().gen())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({:016x})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Session (instance) identity - one logical broadcast session
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    #[inline]
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:016x})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Owner identity - the stream (broadcaster) a relay serves
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl OwnerId {
    #[inline]
    pub fn new(id: u64) -> Self {
        OwnerId(id)
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({:016x})", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Control event identity - unique per originating peer
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventId {
    pub origin: PeerId,
    pub seq: u64,
}

impl EventId {
    #[inline]
    pub fn new(origin: PeerId, seq: u64) -> Self {
        EventId { origin, seq }
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({:016x}:{})", self.origin.0, self.seq)
    }
}

/// Shared per-session secret separating tree-internal links from viewers
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        SessionToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Never print the secret itself.
impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken(..{})", self.0.len())
    }
}

/// Node identity bundle, fixed for the lifetime of a node process
///
/// The shared session token is configuration and lives in `NodeConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub peer: PeerId,
    pub session: SessionId,
    pub owner: OwnerId,
}

impl NodeIdentity {
    pub fn new(peer: PeerId, session: SessionId, owner: OwnerId) -> Self {
        NodeIdentity {
            peer,
            session,
            owner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_is_fixed_width() {
        assert_eq!(PeerId::new(0xAB).to_string(), "00000000000000ab");
        assert_eq!(format!("{:?}", PeerId::new(1)), "Peer(0000000000000001)");
    }

    #[test]
    fn test_generated_peers_differ() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_debug_hides_secret() {
        let token = SessionToken::new("hunter2");
        let shown = format!("{:?}", token);
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn test_peer_id_serializes_as_number() {
        let json = serde_json::to_string(&PeerId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
