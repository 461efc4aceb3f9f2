//! End-to-end scenarios
//!
//! Whole-overlay behavior:
//! - Placement under fan-out pressure and concurrent joins
//! - Bumping and relocation of mismatched occupants
//! - Attach timeout recovery around unresponsive parents
//! - Viewer-zero shutdown grace
//! - Exactly-once control flooding and viewer aggregation

use canopy_core::{Depth, NodeConfig, PeerId};
use canopy_runtime::InitParams;

use crate::Overlay;

// ============================================================================
// TOPOLOGIES
// ============================================================================

/// Peer id of the origin in every standard topology
pub const ORIGIN: PeerId = PeerId(1);

fn depth(d: u32) -> Depth {
    Depth::new(d).unwrap_or(Depth::VIEWER)
}

/// Two-level relay tree with viewers under every leaf
///
/// ```text
///            origin (3)
///          /           \
///      A (2)           D (2)
///     /     \         /     \
///   B (1)  C (1)    E (1)  F (1)
///    |     | |       |     | |
///    v     v v       v     v v
/// ```
pub struct BranchingTree {
    pub overlay: Overlay,
    pub relays: [PeerId; 2],
    pub leaves: [PeerId; 4],
    /// Viewers per leaf, in leaf order
    pub viewers: Vec<Vec<PeerId>>,
}

impl BranchingTree {
    pub fn all_viewers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.viewers.iter().flatten().copied()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.relays.iter().chain(self.leaves.iter()).copied()
    }
}

/// Build the branching tree with fan-out 2
///
/// Leaves B, C, E and F hold 1, 2, 1 and 2 viewers.
pub fn branching_tree() -> BranchingTree {
    let mut overlay = Overlay::new(NodeConfig::default().with_fanout(2));
    overlay.add_origin(ORIGIN, depth(3));

    let a = PeerId::new(10);
    let d = PeerId::new(20);
    let leaves = [
        PeerId::new(11),
        PeerId::new(12),
        PeerId::new(21),
        PeerId::new(22),
    ];

    // A takes the origin, B and C fill A, D finds A full and falls back to
    // the origin, E and F fill D.
    overlay.join(a, InitParams::new(ORIGIN).with_depth(depth(2)));
    overlay.join(leaves[0], InitParams::new(ORIGIN));
    overlay.join(leaves[1], InitParams::new(ORIGIN));
    overlay.join(d, InitParams::new(ORIGIN).with_depth(depth(2)));
    overlay.join(leaves[2], InitParams::new(ORIGIN));
    overlay.join(leaves[3], InitParams::new(ORIGIN));

    let mut viewers = Vec::new();
    let mut next = 100;
    for (leaf, count) in leaves.iter().zip([1, 2, 1, 2]) {
        let mut group = Vec::new();
        for _ in 0..count {
            let viewer = PeerId::new(next);
            next += 1;
            overlay.add_viewer(viewer, *leaf);
            group.push(viewer);
        }
        viewers.push(group);
    }

    BranchingTree {
        overlay,
        relays: [a, d],
        leaves,
        viewers,
    }
}

/// Build an arbitrary tree from parent choices
///
/// Node `i` (peer id `i + 2`) attaches under the parent picked by
/// `choices[i]` among the origin and every earlier node that can still hold
/// relay children. Depths are seeded to match, so no node is bumped, and the
/// registry is unavailable so every node attaches to its bootstrap parent.
pub fn random_tree(choices: &[u8]) -> (Overlay, Vec<(PeerId, PeerId)>) {
    let height = 4;
    let mut overlay = Overlay::new(NodeConfig::default().with_fanout(choices.len() + 1));
    overlay.add_origin(ORIGIN, depth(height));
    overlay.registry().set_available(false);

    let mut eligible = vec![(ORIGIN, height)];
    let mut edges = Vec::new();
    for (i, choice) in choices.iter().enumerate() {
        let peer = PeerId::new(i as u64 + 2);
        let (parent, parent_depth) = eligible[usize::from(*choice) % eligible.len()];
        let own = parent_depth - 1;
        overlay.join(
            peer,
            InitParams::new(ORIGIN)
                .with_first_attach(parent)
                .with_depth(depth(own)),
        );
        if own > 1 {
            eligible.push((peer, own));
        }
        edges.push((peer, parent));
    }
    (overlay, edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::ATTACH_TIMEOUT;
    use canopy_registry::{Registry, RegistryEntry};
    use canopy_runtime::NodeState;
    use canopy_wire::ControlMessage;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::{Duration, SystemTime};

    const BUMP_GRACE: Duration = Duration::from_millis(100);

    fn p(id: u64) -> PeerId {
        PeerId::new(id)
    }

    fn overlay(fanout: usize, origin_depth: u32) -> Overlay {
        let mut overlay = Overlay::new(NodeConfig::default().with_fanout(fanout));
        overlay.add_origin(ORIGIN, depth(origin_depth));
        overlay
    }

    fn streaming(overlay: &Overlay, peer: PeerId) -> bool {
        overlay
            .node(peer)
            .is_some_and(|n| n.has_stream() && n.state() == NodeState::Streaming)
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    #[test]
    fn test_quick_succession_redirects_third_join() {
        let mut overlay = overlay(2, 2);
        let (a, b, c) = (p(10), p(11), p(12));
        overlay.bootstrap(a, InitParams::new(ORIGIN));
        overlay.bootstrap(b, InitParams::new(ORIGIN));
        overlay.bootstrap(c, InitParams::new(ORIGIN));
        overlay.run();

        assert_eq!(overlay.children(ORIGIN), vec![a, b]);
        assert_eq!(overlay.children(a), vec![c]);
        assert_eq!(overlay.upstream(c), Some(a));
        assert!(streaming(&overlay, a));
        assert!(streaming(&overlay, b));
        assert!(streaming(&overlay, c));
        assert_eq!(overlay.registry().parents_of(c), vec![a]);

        let origin = overlay.node(ORIGIN).unwrap();
        assert_eq!(origin.stats().redirects, 1);
        assert_eq!(origin.stats().rejected, 0);
        assert!(overlay.sent().iter().any(|s| s.from == ORIGIN
            && s.to == c
            && matches!(s.message, ControlMessage::Redirect { parent, .. } if parent == a)));

        overlay.advance(Duration::from_secs(60));
        assert!(streaming(&overlay, c));
        assert_eq!(overlay.node(c).unwrap().stats().attach_timeouts, 0);
    }

    #[test]
    fn test_attach_retries_bounded_when_nothing_has_room() {
        let mut overlay = overlay(1, 2);
        let (a, c) = (p(10), p(11));
        overlay.join(a, InitParams::new(ORIGIN));
        overlay.add_viewer(p(100), a);

        // The origin is full and its only child is full of viewers.
        overlay.join(c, InitParams::new(ORIGIN));
        let origin = overlay.node(ORIGIN).unwrap();
        assert_eq!(origin.stats().rejected, 1);
        assert_eq!(origin.stats().redirects, 0);
        assert!(!overlay.node(c).unwrap().has_stream());

        let attempts = overlay.config().max_attach_attempts;
        overlay.advance(ATTACH_TIMEOUT * (attempts + 1));
        let node = overlay.node(c).unwrap();
        assert!(node.is_closed());
        assert!(overlay.is_shut_down(c));
        assert_eq!(node.stats().attach_timeouts, u64::from(attempts));
        assert_eq!(node.stats().placements, u64::from(attempts));
        assert_eq!(overlay.children(ORIGIN), vec![a]);
        assert!(streaming(&overlay, a));
    }

    #[test]
    fn test_concurrent_joins_converge_through_redirect() {
        let mut overlay = overlay(2, 3);
        let (r, x, y1, y2) = (p(10), p(11), p(12), p(13));
        overlay.join(r, InitParams::new(ORIGIN).with_depth(depth(2)));
        overlay.join(x, InitParams::new(ORIGIN));

        // Replay the interleaving where y2 reads R before y1's summary lands,
        // so both see one free slot.
        overlay.bootstrap(y1, InitParams::new(ORIGIN));
        overlay.registry().release_self(y1).unwrap();
        overlay.bootstrap(y2, InitParams::new(ORIGIN));
        overlay
            .registry()
            .attach_as_child(r, y1, Depth::VIEWER, SystemTime::now())
            .unwrap();
        assert_eq!(overlay.registry().entry(r).unwrap().unwrap().children.len(), 3);
        overlay.run();

        assert_eq!(overlay.children(r), vec![x, y1]);
        assert_eq!(overlay.node(r).unwrap().stats().redirects, 1);
        assert_eq!(overlay.upstream(y2), Some(x));
        assert!(streaming(&overlay, y2));
        assert_eq!(overlay.children(x), vec![y2]);
        assert_eq!(overlay.registry().parents_of(y2), vec![x]);
        assert_eq!(overlay.registry().parents_of(y1), vec![r]);
        for node in overlay.nodes() {
            assert!(node.downstream().occupancy() <= 2);
        }

        overlay.advance(ATTACH_TIMEOUT * 2);
        assert_eq!(overlay.node(y2).unwrap().stats().attach_timeouts, 0);
    }

    // ------------------------------------------------------------------
    // Bumping
    // ------------------------------------------------------------------

    #[test]
    fn test_matching_depth_relay_admits_without_bump() {
        let mut overlay = overlay(2, 3);
        let (r, x, y) = (p(10), p(11), p(12));
        overlay.join(r, InitParams::new(ORIGIN).with_depth(depth(2)));
        overlay.join(x, InitParams::new(ORIGIN));
        overlay.join(y, InitParams::new(ORIGIN));

        // Depth-1 children are exactly what a depth-2 relay expects.
        assert_eq!(overlay.children(r), vec![x, y]);
        assert_eq!(overlay.node(r).unwrap().stats().bumps, 0);
        overlay.advance(BUMP_GRACE * 2);
        assert_eq!(overlay.upstream(x), Some(r));
        assert_eq!(overlay.upstream(y), Some(r));
    }

    #[test]
    fn test_mismatched_occupant_bumped_under_newcomer() {
        let mut overlay = overlay(2, 4);
        let (r, x, y) = (p(10), p(11), p(12));
        overlay.join(r, InitParams::new(ORIGIN).with_depth(depth(3)));
        overlay.join(x, InitParams::new(ORIGIN));
        assert_eq!(overlay.children(r), vec![x]);

        overlay.join(y, InitParams::new(ORIGIN));
        assert_eq!(overlay.children(r), vec![y]);
        assert_eq!(overlay.node(r).unwrap().stats().bumps, 1);
        // The instruction waits for the grace period.
        assert_eq!(overlay.upstream(x), Some(r));

        overlay.advance(BUMP_GRACE);
        assert!(overlay.sent().iter().any(|s| s.from == r
            && s.to == x
            && matches!(s.message, ControlMessage::Relocate { new_parent, .. } if new_parent == y)));

        let moved = overlay.node(x).unwrap();
        assert_eq!(moved.upstream(), Some(y));
        assert_eq!(moved.depth(), depth(2));
        assert_eq!(moved.stats().relocations, 1);
        assert_eq!(moved.stats().placements, 2);
        assert!(streaming(&overlay, x));
        assert_eq!(overlay.children(y), vec![x]);
        assert_eq!(overlay.registry().parents_of(x), vec![y]);
        assert_eq!(overlay.registry().parents_of(y), vec![r]);
    }

    // ------------------------------------------------------------------
    // Attach timeout
    // ------------------------------------------------------------------

    #[test]
    fn test_unresponsive_parent_replaced_after_timeout() {
        let mut overlay = overlay(2, 4);
        let (unresponsive, q, n) = (p(10), p(11), p(12));
        overlay.join(q, InitParams::new(ORIGIN).with_depth(depth(3)));

        // A registered relay that never answers.
        overlay
            .registry()
            .register(RegistryEntry::new(unresponsive, overlay.owner(), depth(2)))
            .unwrap();
        overlay.set_unreachable(unresponsive, true);

        overlay.join(n, InitParams::new(ORIGIN));
        assert_eq!(overlay.upstream(n), Some(unresponsive));
        assert_eq!(overlay.node(n).unwrap().state(), NodeState::Attaching);

        // Fill it so the retry has to look elsewhere.
        for filler in 0..2 {
            overlay
                .registry()
                .attach_as_child(unresponsive, p(900 + filler), Depth::VIEWER, SystemTime::now())
                .unwrap();
        }

        overlay.advance(ATTACH_TIMEOUT);
        let node = overlay.node(n).unwrap();
        assert_eq!(node.upstream(), Some(q));
        assert_eq!(node.stats().attach_timeouts, 1);
        assert_eq!(node.stats().placements, 2);
        assert!(streaming(&overlay, n));
        assert_eq!(overlay.registry().parents_of(n), vec![q]);

        overlay.advance(ATTACH_TIMEOUT * 2);
        assert_eq!(overlay.node(n).unwrap().stats().attach_timeouts, 1);
    }

    // ------------------------------------------------------------------
    // Viewer-zero shutdown
    // ------------------------------------------------------------------

    #[test]
    fn test_returning_viewer_cancels_shutdown() {
        let mut overlay = overlay(2, 2);
        let v = p(10);
        overlay.join(v, InitParams::new(ORIGIN));
        overlay.add_viewer(p(100), v);
        overlay.disconnect_viewer(p(100));
        assert!(overlay.node(v).unwrap().shutdown_pending());

        overlay.advance(Duration::from_millis(500));
        overlay.add_viewer(p(101), v);
        assert!(!overlay.node(v).unwrap().shutdown_pending());

        overlay.advance(Duration::from_secs(2));
        assert!(streaming(&overlay, v));
        assert!(!overlay.is_shut_down(v));
        assert_eq!(overlay.node(ORIGIN).unwrap().viewers(), 1);
    }

    #[test]
    fn test_last_viewer_leaving_closes_node() {
        let mut overlay = overlay(2, 2);
        let v = p(10);
        overlay.join(v, InitParams::new(ORIGIN));
        let log_id = overlay.node(v).unwrap().log_id();
        overlay.add_viewer(p(100), v);
        overlay.disconnect_viewer(p(100));

        overlay.advance(Duration::from_millis(999));
        assert!(!overlay.is_shut_down(v));
        overlay.advance(Duration::from_millis(1));

        assert!(overlay.is_shut_down(v));
        assert!(overlay.node(v).unwrap().is_closed());
        assert!(overlay.children(ORIGIN).is_empty());
        assert!(overlay.session_log().get(log_id).unwrap().end.is_some());
        assert_eq!(overlay.link_count(), 0);
    }

    // ------------------------------------------------------------------
    // Flooding and aggregation
    // ------------------------------------------------------------------

    #[test]
    fn test_branching_tree_shape() {
        let tree = branching_tree();
        let [a, d] = tree.relays;
        let [b, c, e, f] = tree.leaves;
        assert_eq!(tree.overlay.children(ORIGIN), vec![a, d]);
        assert_eq!(tree.overlay.children(a), vec![b, c]);
        assert_eq!(tree.overlay.children(d), vec![e, f]);
        for node in tree.all_nodes() {
            assert!(streaming(&tree.overlay, node));
        }
        for viewer in tree.all_viewers() {
            assert!(tree.overlay.viewer(viewer).unwrap().has_stream());
        }
    }

    #[test]
    fn test_origin_event_reaches_everyone_once() {
        let mut tree = branching_tree();
        let event = tree
            .overlay
            .broadcast(ORIGIN, "device-change", json!({"camera": "rear"}))
            .unwrap();

        for node in tree.all_nodes() {
            assert_eq!(tree.overlay.deliveries_of(node, &event), 1, "node {}", node);
        }
        for viewer in tree.all_viewers() {
            assert_eq!(tree.overlay.deliveries_of(viewer, &event), 1, "viewer {}", viewer);
        }
        assert_eq!(tree.overlay.deliveries_of(ORIGIN, &event), 0);
    }

    #[test]
    fn test_leaf_event_floods_whole_tree_once() {
        let mut tree = branching_tree();
        let e = tree.leaves[2];
        let event = tree
            .overlay
            .broadcast(e, "device-change", json!({"mic": false}))
            .unwrap();

        assert_eq!(tree.overlay.deliveries_of(ORIGIN, &event), 1);
        for node in tree.all_nodes().filter(|n| *n != e) {
            assert_eq!(tree.overlay.deliveries_of(node, &event), 1, "node {}", node);
        }
        assert_eq!(tree.overlay.deliveries_of(e, &event), 0);
        for viewer in tree.all_viewers() {
            assert_eq!(tree.overlay.deliveries_of(viewer, &event), 1, "viewer {}", viewer);
        }
    }

    #[test]
    fn test_viewer_counts_aggregate_to_origin() {
        let mut tree = branching_tree();
        let [a, d] = tree.relays;
        assert_eq!(tree.overlay.node(ORIGIN).unwrap().viewers(), 6);
        assert_eq!(tree.overlay.node(a).unwrap().viewers(), 3);
        assert_eq!(tree.overlay.node(d).unwrap().viewers(), 3);

        let leaving = tree.viewers[1][0];
        tree.overlay.disconnect_viewer(leaving);
        assert_eq!(tree.overlay.node(a).unwrap().viewers(), 2);
        assert_eq!(tree.overlay.node(ORIGIN).unwrap().viewers(), 5);
    }

    #[test]
    fn test_killed_leaf_releases_and_drops_from_total() {
        let mut tree = branching_tree();
        let [_, d] = tree.relays;
        let [_, _, e, f] = tree.leaves;
        let log_id = tree.overlay.node(e).unwrap().log_id();

        tree.overlay.kill(e);
        assert!(tree.overlay.is_shut_down(e));
        assert_eq!(tree.overlay.children(d), vec![f]);
        assert!(tree.overlay.registry().parents_of(e).is_empty());
        assert!(tree.overlay.session_log().get(log_id).unwrap().end.is_some());
        assert_eq!(tree.overlay.node(ORIGIN).unwrap().viewers(), 5);
        assert_eq!(tree.overlay.viewer(tree.viewers[2][0]).unwrap().link_count(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_flood_reaches_every_node_once(
            choices in proptest::collection::vec(any::<u8>(), 2..10),
            from in any::<u8>(),
        ) {
            let (mut overlay, edges) = random_tree(&choices);
            for (peer, parent) in &edges {
                prop_assert_eq!(overlay.upstream(*peer), Some(*parent));
            }

            let event = overlay.broadcast(ORIGIN, "ping", json!(null)).unwrap();
            for (peer, _) in &edges {
                prop_assert_eq!(overlay.deliveries_of(*peer, &event), 1);
            }

            let source = edges[usize::from(from) % edges.len()].0;
            let event = overlay.broadcast(source, "pong", json!(null)).unwrap();
            prop_assert_eq!(overlay.deliveries_of(source, &event), 0);
            prop_assert_eq!(overlay.deliveries_of(ORIGIN, &event), 1);
            for (peer, _) in edges.iter().filter(|(p, _)| *p != source) {
                prop_assert_eq!(overlay.deliveries_of(*peer, &event), 1);
            }
        }
    }
}
