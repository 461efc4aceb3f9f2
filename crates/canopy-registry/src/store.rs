//! Registry client contract
//!
//! Every operation is safe under concurrent calls from many nodes and may
//! fail transiently. A failed call has no effect; nothing is retried inside
//! the client.

use std::time::SystemTime;

use canopy_core::{CanopyResult, Depth, OwnerId, PeerId};

use crate::RegistryEntry;

pub trait Registry: Send + Sync {
    /// Insert this node's own document, or reset its depth if it exists
    fn register(&self, entry: RegistryEntry) -> CanopyResult<()>;

    /// Remove this node's child summary from every document listing it
    ///
    /// Idempotent.
    fn release_self(&self, peer: PeerId) -> CanopyResult<()>;

    /// Append a child summary to the parent's document
    ///
    /// A parent without a document (the origin) is left untouched.
    fn attach_as_child(
        &self,
        parent: PeerId,
        peer: PeerId,
        depth: Depth,
        timestamp: SystemTime,
    ) -> CanopyResult<()>;

    /// Shallowest non-full relay of this owner, other than `exclude`
    ///
    /// Candidates have an assigned depth greater than one and strictly fewer
    /// than `capacity` children. Ties on depth go to the lowest peer id.
    fn find_open_slot(
        &self,
        owner: OwnerId,
        capacity: usize,
        exclude: PeerId,
    ) -> CanopyResult<Option<RegistryEntry>>;

    /// Prune stale (unassigned-depth) children and set this node's depth
    fn reparent_self(&self, peer: PeerId, depth: Depth) -> CanopyResult<()>;

    /// Update the depth on this node's summary wherever it is a child
    fn propagate_depth_to_self_entries(&self, peer: PeerId, depth: Depth) -> CanopyResult<()>;

    /// Mark this owner's childless documents as having no fixed host
    fn reclaim_empty_owners(&self, owner: OwnerId) -> CanopyResult<()>;

    /// Read one document
    fn entry(&self, peer: PeerId) -> CanopyResult<Option<RegistryEntry>>;

    /// Move this node's summary under a new parent
    ///
    /// Two separate operations; a failure between them leaves the node
    /// released and unlisted, which the next placement repairs.
    fn relocate_under(
        &self,
        parent: PeerId,
        peer: PeerId,
        depth: Depth,
        timestamp: SystemTime,
    ) -> CanopyResult<()> {
        self.release_self(peer)?;
        self.attach_as_child(parent, peer, depth, timestamp)
    }
}
