//! Depth - the placement hint carried by every relay
//!
//! Depth is 1 at the viewer-facing layer and grows by one per hop toward the
//! origin. It is a tie-breaker and rebalancing signal, not an authority level.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tree-level hint, always >= 1
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Depth(u32);

impl Depth {
    /// The viewer-facing layer
    pub const VIEWER: Depth = Depth(1);

    /// Create a depth, rejecting zero
    #[inline]
    pub fn new(depth: u32) -> Option<Self> {
        (depth >= 1).then_some(Depth(depth))
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// The depth a direct child of a node at this depth is expected to carry
    ///
    /// `None` for the viewer-facing layer: nothing sits below depth 1.
    #[inline]
    pub fn child(self) -> Option<Depth> {
        Depth::new(self.0 - 1)
    }

    #[inline]
    pub fn is_viewer_facing(self) -> bool {
        self.0 == 1
    }

    /// Eligible to be offered as an open slot
    #[inline]
    pub fn is_relay(self) -> bool {
        self.0 > 1
    }
}

impl Default for Depth {
    fn default() -> Self {
        Depth::VIEWER
    }
}

impl TryFrom<u32> for Depth {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Depth::new(value).ok_or_else(|| format!("depth must be >= 1, got {}", value))
    }
}

impl From<Depth> for u32 {
    fn from(depth: Depth) -> u32 {
        depth.0
    }
}

impl fmt::Debug for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Depth({})", self.0)
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
