//! Placement - choosing the upstream a node attaches to
//!
//! The node always releases its own child summaries first, so a retried
//! placement never leaves it listed under two parents. A registry outage
//! degrades to the bootstrap parent rather than failing the placement.
//! A parent named by a relocation or redirect replaces the slot search.

use std::time::SystemTime;

use canopy_core::{CanopyResult, Depth, OwnerId, PeerId};
use canopy_registry::Registry;

/// Inputs to a placement decision
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest {
    pub peer: PeerId,
    pub owner: OwnerId,
    /// Depth the node currently holds
    pub depth: Depth,
    pub capacity: usize,
    /// Parent named by a relocation or redirect; skips the slot search
    pub preferred: Option<PeerId>,
    /// Parent to use when the registry offers nothing
    pub fallback: Option<PeerId>,
}

/// Outcome of a placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub parent: PeerId,
    /// New depth, set when the registry offered a slot
    pub depth: Option<Depth>,
    /// Attaching to the bootstrap parent rather than a registry slot
    pub origin_client: bool,
}

/// Pick an upstream and record the choice in the registry
///
/// Returns `None` only when the registry offered nothing and there is no
/// fallback parent.
pub fn place(
    registry: &dyn Registry,
    request: &PlacementRequest,
    timestamp: SystemTime,
) -> Option<Placement> {
    if let Err(e) = registry.release_self(request.peer) {
        tracing::warn!(peer = %request.peer, error = %e, "Failed to release previous placement");
    }

    let slot = match request.preferred {
        Some(_) => None,
        None => match registry.find_open_slot(request.owner, request.capacity, request.peer) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(peer = %request.peer, error = %e, "Open slot search failed, using bootstrap parent");
                None
            }
        },
    };

    let placement = match (request.preferred, slot) {
        (Some(parent), _) => Placement {
            parent,
            depth: None,
            origin_client: false,
        },
        (None, Some(slot)) => Placement {
            parent: slot.peer,
            depth: Some(Depth::VIEWER),
            origin_client: false,
        },
        (None, None) => Placement {
            parent: request.fallback?,
            depth: None,
            origin_client: true,
        },
    };

    let depth = placement.depth.unwrap_or(request.depth);
    if let Err(e) = registry.attach_as_child(placement.parent, request.peer, depth, timestamp) {
        tracing::warn!(
            peer = %request.peer,
            parent = %placement.parent,
            error = %e,
            "Failed to record child summary"
        );
    }

    tracing::debug!(
        peer = %request.peer,
        parent = %placement.parent,
        origin_client = placement.origin_client,
        "Placement chosen"
    );
    Some(placement)
}

/// Registry bookkeeping for a node told to move under `parent`
///
/// Resets the node's own depth, prunes stale children and moves its summary.
/// Each step is attempted even if an earlier one failed.
pub fn relocate(
    registry: &dyn Registry,
    peer: PeerId,
    parent: PeerId,
    depth: Depth,
    timestamp: SystemTime,
) -> CanopyResult<()> {
    let steps = [
        registry.reparent_self(peer, depth),
        registry.propagate_depth_to_self_entries(peer, depth),
        registry.relocate_under(parent, peer, depth, timestamp),
    ];
    let mut result = Ok(());
    for step in steps {
        if let Err(e) = step {
            tracing::warn!(%peer, %parent, error = %e, "Relocation bookkeeping step failed");
            result = Err(e);
        }
    }
    result
}
