//! Redirect - pointing a newcomer at a child of a full parent

use canopy_core::PeerId;

use crate::DownstreamEntry;

/// Child of a full node that should take `newcomer` instead
///
/// Only relay children (entries with a known depth) can host. `load` gives a
/// child's known downstream count; children known to be full are skipped and
/// children with unknown load rank after every child with known room. Ties
/// keep admission order.
pub fn select_redirect_target<F>(
    entries: &[DownstreamEntry],
    newcomer: PeerId,
    capacity: usize,
    load: F,
) -> Option<PeerId>
where
    F: Fn(PeerId) -> Option<usize>,
{
    entries
        .iter()
        .filter(|e| e.depth.is_some() && e.peer != newcomer)
        .filter_map(|e| match load(e.peer) {
            Some(used) if used >= capacity => None,
            Some(used) => Some((used, e.peer)),
            None => Some((capacity, e.peer)),
        })
        .enumerate()
        .min_by_key(|(order, (used, _))| (*used, *order))
        .map(|(_, (_, peer))| peer)
}
