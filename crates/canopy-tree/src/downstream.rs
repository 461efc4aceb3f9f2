//! Downstream and limbo sets
//!
//! A node forwards to at most `capacity` peers. Peers accepted before the
//! node has a stream wait in limbo; limbo counts toward the same bound so
//! that promotion can never overflow the forwarding set.

use std::time::Instant;

use canopy_core::{CanopyError, CanopyResult, Depth, PeerId};
use canopy_transport::ConnectionId;

/// A peer this node forwards the stream to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamEntry {
    pub peer: PeerId,
    /// Link the peer opened to us (subtree attach or viewer link)
    pub attach: Option<ConnectionId>,
    /// Control replica we opened toward the peer
    pub replica: Option<ConnectionId>,
    /// Media call, placed once the peer reports ready
    pub call: Option<ConnectionId>,
    /// Depth of the peer if it is a relay
    pub depth: Option<Depth>,
    pub attached_at: Instant,
}

impl DownstreamEntry {
    /// Every link held for this peer
    pub fn links(&self) -> Vec<ConnectionId> {
        [self.call, self.replica, self.attach]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// A peer accepted before any stream arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimboEntry {
    pub peer: PeerId,
    pub attach: Option<ConnectionId>,
    pub depth: Option<Depth>,
    pub accepted_at: Instant,
}

/// A peer that left either set, with the links the caller must close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub peer: PeerId,
    pub depth: Option<Depth>,
    pub links: Vec<ConnectionId>,
    pub was_forwarding: bool,
}

impl From<DownstreamEntry> for Departed {
    fn from(entry: DownstreamEntry) -> Self {
        Departed {
            peer: entry.peer,
            depth: entry.depth,
            links: entry.links(),
            was_forwarding: true,
        }
    }
}

impl From<LimboEntry> for Departed {
    fn from(entry: LimboEntry) -> Self {
        Departed {
            peer: entry.peer,
            depth: entry.depth,
            links: entry.attach.into_iter().collect(),
            was_forwarding: false,
        }
    }
}

/// Bounded downstream set with its limbo queue
#[derive(Debug)]
pub struct DownstreamSet {
    capacity: usize,
    entries: Vec<DownstreamEntry>,
    limbo: Vec<LimboEntry>,
}

impl DownstreamSet {
    pub fn new(capacity: usize) -> Self {
        DownstreamSet {
            capacity: capacity.max(1),
            entries: Vec::new(),
            limbo: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forwarding entries, in admission order
    pub fn entries(&self) -> &[DownstreamEntry] {
        &self.entries
    }

    pub fn limbo(&self) -> &[LimboEntry] {
        &self.limbo
    }

    /// Forwarding entries only
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forwarding plus limbo
    pub fn occupancy(&self) -> usize {
        self.entries.len() + self.limbo.len()
    }

    pub fn has_room(&self) -> bool {
        self.occupancy() < self.capacity
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.entries.iter().any(|e| e.peer == peer) || self.limbo.iter().any(|e| e.peer == peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&DownstreamEntry> {
        self.entries.iter().find(|e| e.peer == peer)
    }

    fn check_admission(&self, peer: PeerId) -> CanopyResult<()> {
        if self.contains(peer) {
            return Err(CanopyError::ProtocolViolation(format!(
                "peer {} is already downstream",
                peer
            )));
        }
        if !self.has_room() {
            return Err(CanopyError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Admit a peer straight into forwarding
    pub fn admit(&mut self, entry: DownstreamEntry) -> CanopyResult<()> {
        self.check_admission(entry.peer)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Admit a peer into limbo
    pub fn admit_limbo(&mut self, entry: LimboEntry) -> CanopyResult<()> {
        self.check_admission(entry.peer)?;
        self.limbo.push(entry);
        Ok(())
    }

    /// Move every limbo entry into forwarding
    ///
    /// `open_replica` is called once per promoted peer and returns the handle
    /// of the control replica opened toward it.
    pub fn promote_limbo<F>(&mut self, now: Instant, mut open_replica: F) -> Vec<PeerId>
    where
        F: FnMut(PeerId) -> ConnectionId,
    {
        let promoted: Vec<LimboEntry> = self.limbo.drain(..).collect();
        let mut peers = Vec::with_capacity(promoted.len());
        for limbo in promoted {
            let replica = open_replica(limbo.peer);
            peers.push(limbo.peer);
            self.entries.push(DownstreamEntry {
                peer: limbo.peer,
                attach: limbo.attach,
                replica: Some(replica),
                call: None,
                depth: limbo.depth,
                attached_at: now,
            });
        }
        peers
    }

    /// Record the media call placed to a forwarding peer
    pub fn set_call(&mut self, peer: PeerId, call: ConnectionId) -> Option<ConnectionId> {
        let entry = self.entries.iter_mut().find(|e| e.peer == peer)?;
        entry.call.replace(call)
    }

    /// Remove a peer from whichever set holds it
    pub fn remove(&mut self, peer: PeerId) -> Option<Departed> {
        if let Some(pos) = self.entries.iter().position(|e| e.peer == peer) {
            return Some(self.entries.remove(pos).into());
        }
        if let Some(pos) = self.limbo.iter().position(|e| e.peer == peer) {
            return Some(self.limbo.remove(pos).into());
        }
        None
    }

    /// Remove every peer whose depth fails `keep`
    pub fn prune<F>(&mut self, keep: F) -> Vec<Departed>
    where
        F: Fn(Option<Depth>) -> bool,
    {
        let mut departed = Vec::new();
        let (kept, gone): (Vec<_>, Vec<_>) = self.entries.drain(..).partition(|e| keep(e.depth));
        self.entries = kept;
        departed.extend(gone.into_iter().map(Departed::from));

        let (kept, gone): (Vec<_>, Vec<_>) = self.limbo.drain(..).partition(|e| keep(e.depth));
        self.limbo = kept;
        departed.extend(gone.into_iter().map(Departed::from));
        departed
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<Departed> {
        self.prune(|_| false)
    }

    /// Peer owning a link, in either set
    pub fn peer_of_link(&self, conn: ConnectionId) -> Option<PeerId> {
        self.entries
            .iter()
            .find(|e| e.links().contains(&conn))
            .map(|e| e.peer)
            .or_else(|| {
                self.limbo
                    .iter()
                    .find(|e| e.attach == Some(conn))
                    .map(|e| e.peer)
            })
    }

    pub fn calls(&self) -> Vec<ConnectionId> {
        self.entries.iter().filter_map(|e| e.call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limbo(peer: u64, depth: Option<u32>) -> LimboEntry {
        LimboEntry {
            peer: PeerId::new(peer),
            attach: Some(ConnectionId(peer)),
            depth: depth.and_then(Depth::new),
            accepted_at: Instant::now(),
        }
    }

    fn forwarding(peer: u64, depth: Option<u32>) -> DownstreamEntry {
        DownstreamEntry {
            peer: PeerId::new(peer),
            attach: Some(ConnectionId(peer)),
            replica: Some(ConnectionId(100 + peer)),
            call: None,
            depth: depth.and_then(Depth::new),
            attached_at: Instant::now(),
        }
    }

    #[test]
    fn test_limbo_counts_toward_capacity() {
        let mut set = DownstreamSet::new(2);
        set.admit_limbo(limbo(1, None)).unwrap();
        set.admit(forwarding(2, None)).unwrap();
        let err = set.admit_limbo(limbo(3, None)).unwrap_err();
        assert_eq!(err, CanopyError::CapacityExceeded { capacity: 2 });
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut set = DownstreamSet::new(4);
        set.admit_limbo(limbo(1, None)).unwrap();
        assert!(matches!(
            set.admit(forwarding(1, None)),
            Err(CanopyError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_promote_limbo_moves_everything() {
        let mut set = DownstreamSet::new(3);
        set.admit_limbo(limbo(1, Some(2))).unwrap();
        set.admit_limbo(limbo(2, None)).unwrap();

        let mut next = 50;
        let promoted = set.promote_limbo(Instant::now(), |_| {
            next += 1;
            ConnectionId(next)
        });

        assert_eq!(promoted, vec![PeerId::new(1), PeerId::new(2)]);
        assert!(set.limbo().is_empty());
        assert_eq!(set.len(), 2);
        assert_eq!(set.entries()[0].replica, Some(ConnectionId(51)));
        assert_eq!(set.entries()[0].depth, Depth::new(2));
    }

    #[test]
    fn test_remove_reports_links() {
        let mut set = DownstreamSet::new(3);
        set.admit(forwarding(1, None)).unwrap();
        set.set_call(PeerId::new(1), ConnectionId(77));

        let departed = set.remove(PeerId::new(1)).unwrap();
        assert!(departed.was_forwarding);
        assert_eq!(
            departed.links,
            vec![ConnectionId(77), ConnectionId(101), ConnectionId(1)]
        );
        assert!(set.remove(PeerId::new(1)).is_none());
    }

    #[test]
    fn test_prune_keeps_matching_depths() {
        let mut set = DownstreamSet::new(4);
        set.admit(forwarding(1, Some(2))).unwrap();
        set.admit(forwarding(2, Some(1))).unwrap();
        set.admit_limbo(limbo(3, None)).unwrap();

        let departed = set.prune(|d| d == Depth::new(2));
        let gone: Vec<PeerId> = departed.iter().map(|d| d.peer).collect();
        assert_eq!(gone, vec![PeerId::new(2), PeerId::new(3)]);
        assert_eq!(set.occupancy(), 1);
    }

    #[test]
    fn test_peer_of_link() {
        let mut set = DownstreamSet::new(4);
        set.admit(forwarding(1, None)).unwrap();
        set.admit_limbo(limbo(2, None)).unwrap();
        assert_eq!(set.peer_of_link(ConnectionId(101)), Some(PeerId::new(1)));
        assert_eq!(set.peer_of_link(ConnectionId(2)), Some(PeerId::new(2)));
        assert_eq!(set.peer_of_link(ConnectionId(999)), None);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Admit(u64),
        AdmitLimbo(u64),
        Remove(u64),
        Promote,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..8).prop_map(Op::Admit),
            (0u64..8).prop_map(Op::AdmitLimbo),
            (0u64..8).prop_map(Op::Remove),
            Just(Op::Promote),
        ]
    }

    proptest! {
        #[test]
        fn occupancy_never_exceeds_capacity(
            capacity in 1usize..5,
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let mut set = DownstreamSet::new(capacity);
            let mut handle = 1000;
            for op in ops {
                match op {
                    Op::Admit(p) => { let _ = set.admit(forwarding(p, None)); }
                    Op::AdmitLimbo(p) => { let _ = set.admit_limbo(limbo(p, None)); }
                    Op::Remove(p) => { set.remove(PeerId::new(p)); }
                    Op::Promote => {
                        set.promote_limbo(Instant::now(), |_| { handle += 1; ConnectionId(handle) });
                    }
                }
                prop_assert!(set.occupancy() <= capacity);
                prop_assert!(set.len() <= capacity);
            }
        }
    }
}
