//! Flood deduplication for control events

use std::collections::{HashSet, VecDeque};

use canopy_core::{EventId, PeerId};

/// Number of event ids remembered per node
pub const FLOOD_MEMORY: usize = 1024;

/// Seen-set for flooded control events
///
/// Bounded: the oldest id is forgotten once `limit` ids are held. Events are
/// flooded at human rates, so the window never wraps in practice.
#[derive(Debug, Clone)]
pub struct FloodFilter {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    limit: usize,
    next_seq: u64,
}

impl Default for FloodFilter {
    fn default() -> Self {
        Self::new(FLOOD_MEMORY)
    }
}

impl FloodFilter {
    pub fn new(limit: usize) -> Self {
        FloodFilter {
            seen: HashSet::new(),
            order: VecDeque::new(),
            limit: limit.max(1),
            next_seq: 0,
        }
    }

    /// Mark an event as handled
    /// Returns true the first time an id is seen
    pub fn accept(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Allocate an id for an event raised by this node, already marked seen
    pub fn originate(&mut self, origin: PeerId) -> EventId {
        self.next_seq += 1;
        let id = EventId::new(origin, self.next_seq);
        self.accept(id);
        id
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut filter = FloodFilter::default();
        let id = EventId::new(PeerId::new(1), 1);
        assert!(filter.accept(id));
        assert!(!filter.accept(id));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_originated_ids_are_seen() {
        let mut filter = FloodFilter::default();
        let a = filter.originate(PeerId::new(7));
        let b = filter.originate(PeerId::new(7));
        assert_ne!(a, b);
        assert!(!filter.accept(a));
        assert!(!filter.accept(b));
    }

    #[test]
    fn test_memory_bounded() {
        let mut filter = FloodFilter::new(2);
        let ids: Vec<_> = (0..3).map(|s| EventId::new(PeerId::new(1), s)).collect();
        for id in &ids {
            filter.accept(*id);
        }
        assert_eq!(filter.len(), 2);
        assert!(!filter.accept(ids[2]));
        // The oldest id fell out of the window.
        assert!(filter.accept(ids[0]));
        assert_eq!(filter.len(), 2);
    }
}
