//! Registry documents

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use canopy_core::{Depth, OwnerId, PeerId};

/// Summary of one child, stored in its parent's document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub peer: PeerId,
    /// `None` marks a stale entry awaiting pruning
    pub depth: Option<Depth>,
    pub timestamp: SystemTime,
}

/// One node's placement document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub peer: PeerId,
    /// `None` once the owner has been reclaimed
    pub owner: Option<OwnerId>,
    /// Unassigned entries are never offered as attachment points
    pub depth: Option<Depth>,
    pub children: Vec<ChildSummary>,
}

impl RegistryEntry {
    pub fn new(peer: PeerId, owner: OwnerId, depth: Depth) -> Self {
        RegistryEntry {
            peer,
            owner: Some(owner),
            depth: Some(depth),
            children: Vec::new(),
        }
    }

    /// Strictly fewer than `capacity` children
    pub fn has_room(&self, capacity: usize) -> bool {
        self.children.len() < capacity
    }

    pub fn lists_child(&self, peer: PeerId) -> bool {
        self.children.iter().any(|c| c.peer == peer)
    }
}
