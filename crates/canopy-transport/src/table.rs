//! Link table - every link a node currently holds
//!
//! The table is the single owner of link records. Tree structures refer to
//! links by [`ConnectionId`] only, and a record leaves the table exactly when
//! the node closes the link or the link reports a terminal event.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use canopy_core::PeerId;

use crate::{ConnectionId, Direction, LinkKind};

/// What a link is used for from this node's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Our subtree attach to our parent
    Upstream,
    /// Media call from our parent
    UpstreamCall,
    /// Control replica opened by our parent
    ParentReplica,
    /// A relay child's subtree attach to us
    Subtree,
    /// A viewer's connection to us
    Viewer,
    /// Control replica we opened toward a downstream peer
    Replica,
    /// Media call we placed to a downstream peer
    DownstreamCall,
    /// Short-lived control-only notice
    Notice,
    /// A trusted peer offering itself as our upstream
    Renegotiate,
    /// A subtree attach we turned away with a redirect; closed once sent
    Redirected,
}

impl LinkRole {
    /// Data links that carry flooded control events
    pub fn floods(self) -> bool {
        matches!(
            self,
            LinkRole::Upstream
                | LinkRole::ParentReplica
                | LinkRole::Subtree
                | LinkRole::Viewer
                | LinkRole::Replica
        )
    }
}

/// Record of one held link
#[derive(Debug, Clone)]
pub struct Link {
    pub id: ConnectionId,
    pub peer: PeerId,
    pub kind: LinkKind,
    pub direction: Direction,
    pub role: LinkRole,
    pub open: bool,
    pub created_at: Instant,
}

/// All links held by one node
#[derive(Debug, Default)]
pub struct LinkTable {
    links: BTreeMap<ConnectionId, Link>,
    next_id: u64,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new link and hand out its handle
    pub fn insert(
        &mut self,
        peer: PeerId,
        kind: LinkKind,
        direction: Direction,
        role: LinkRole,
        now: Instant,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.links.insert(
            id,
            Link {
                id,
                peer,
                kind,
                direction,
                role,
                open: false,
                created_at: now,
            },
        );
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn set_role(&mut self, id: ConnectionId, role: LinkRole) {
        if let Some(link) = self.links.get_mut(&id) {
            link.role = role;
        }
    }

    /// Mark a link open; returns false if it was unknown or already open
    pub fn mark_open(&mut self, id: ConnectionId) -> bool {
        match self.links.get_mut(&id) {
            Some(link) if !link.open => {
                link.open = true;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Link> {
        self.links.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.links.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.links.keys().copied().collect()
    }

    /// Links to a peer, optionally restricted to one role
    pub fn to_peer(&self, peer: PeerId, role: Option<LinkRole>) -> Vec<ConnectionId> {
        self.links
            .values()
            .filter(|l| l.peer == peer && role.map_or(true, |r| l.role == r))
            .map(|l| l.id)
            .collect()
    }

    /// One open flooding link per peer, skipping `except`
    ///
    /// The lowest handle wins when several links reach the same peer.
    pub fn flood_targets(&self, except: Option<PeerId>) -> Vec<ConnectionId> {
        let mut seen = BTreeSet::new();
        self.links
            .values()
            .filter(|l| l.open && l.kind == LinkKind::Data && l.role.floods())
            .filter(|l| Some(l.peer) != except)
            .filter(|l| seen.insert(l.peer))
            .map(|l| l.id)
            .collect()
    }
}
