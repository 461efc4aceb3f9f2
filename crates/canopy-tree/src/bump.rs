//! Bump - relocating a mismatched occupant to make room for a newcomer

use canopy_core::{CanopyError, CanopyResult, Depth, PeerId};

use crate::DownstreamEntry;

/// Occupant to relocate when a relay at `depth` admits `incoming`
///
/// Nothing is bumped when the newcomer already carries the expected child
/// depth. Otherwise the first occupant, in admission order, whose depth is
/// known and differs from the expected child depth is chosen.
pub fn select_bump_candidate(
    depth: Depth,
    incoming: Depth,
    entries: &[DownstreamEntry],
) -> Option<PeerId> {
    let expected = depth.child();
    if expected == Some(incoming) {
        return None;
    }
    entries
        .iter()
        .find(|e| matches!(e.depth, Some(d) if Some(d) != expected))
        .map(|e| e.peer)
}

/// What a relocated node does to itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationPlan {
    /// Depth the node takes under its new parent
    pub depth: Depth,
    /// Depth its own children must carry to be kept
    pub keep: Option<Depth>,
}

impl RelocationPlan {
    /// Plan a move under a parent at `parent_depth`
    pub fn under(parent_depth: Depth) -> CanopyResult<Self> {
        let depth = parent_depth.child().ok_or_else(|| {
            CanopyError::ProtocolViolation(format!(
                "cannot relocate under a parent at depth {}",
                parent_depth
            ))
        })?;
        Ok(RelocationPlan {
            depth,
            keep: depth.child(),
        })
    }

    /// Whether a child at `depth` survives the move
    ///
    /// Children with no known depth are always pruned.
    pub fn keeps(&self, depth: Option<Depth>) -> bool {
        depth.is_some() && depth == self.keep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_transport::ConnectionId;
    use std::time::Instant;

    fn d(depth: u32) -> Depth {
        Depth::new(depth).unwrap()
    }

    fn entry(peer: u64, depth: Option<u32>) -> DownstreamEntry {
        DownstreamEntry {
            peer: PeerId::new(peer),
            attach: Some(ConnectionId(peer)),
            replica: None,
            call: None,
            depth: depth.map(d),
            attached_at: Instant::now(),
        }
    }

    #[test]
    fn test_matching_newcomer_bumps_nothing() {
        let entries = [entry(1, Some(1))];
        assert_eq!(select_bump_candidate(d(3), d(2), &entries), None);
    }

    #[test]
    fn test_first_mismatched_occupant_chosen() {
        let entries = [entry(1, Some(2)), entry(2, Some(1)), entry(3, Some(1))];
        assert_eq!(
            select_bump_candidate(d(3), d(1), &entries),
            Some(PeerId::new(2))
        );
    }

    #[test]
    fn test_unknown_depth_never_bumped() {
        let entries = [entry(1, None), entry(2, None)];
        assert_eq!(select_bump_candidate(d(3), d(1), &entries), None);
    }

    #[test]
    fn test_viewer_facing_relay_expects_nothing() {
        // Every relay child of a depth-1 node is mismatched.
        let entries = [entry(4, Some(1))];
        assert_eq!(
            select_bump_candidate(d(1), d(1), &entries),
            Some(PeerId::new(4))
        );
    }

    #[test]
    fn test_depth_two_relay_with_matching_occupant() {
        let entries = [entry(1, Some(1))];
        assert_eq!(select_bump_candidate(d(2), d(1), &entries), None);
    }

    #[test]
    fn test_relocation_plan() {
        let plan = RelocationPlan::under(d(4)).unwrap();
        assert_eq!(plan.depth, d(3));
        assert!(plan.keeps(Some(d(2))));
        assert!(!plan.keeps(Some(d(1))));
        assert!(!plan.keeps(None));
    }

    #[test]
    fn test_relocation_to_viewer_layer_prunes_all() {
        let plan = RelocationPlan::under(d(2)).unwrap();
        assert_eq!(plan.depth, Depth::VIEWER);
        assert!(!plan.keeps(Some(d(1))));
        assert!(!plan.keeps(None));
    }

    #[test]
    fn test_relocation_under_viewer_layer_rejected() {
        assert!(matches!(
            RelocationPlan::under(Depth::VIEWER),
            Err(CanopyError::ProtocolViolation(_))
        ));
    }
}
