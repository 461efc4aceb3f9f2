//! Viewer tally
//!
//! A viewer-facing node reports its raw downstream count. Every relay above
//! it keeps the last count each child reported and reports the sum.

use std::collections::BTreeMap;

use canopy_core::{Depth, PeerId};

/// Last reported count per child
#[derive(Debug, Default, Clone)]
pub struct ViewerTally {
    reports: BTreeMap<PeerId, u32>,
}

impl ViewerTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a child's report; returns whether the sum changed
    pub fn record(&mut self, child: PeerId, viewers: u32) -> bool {
        let previous = self.reports.insert(child, viewers);
        previous.unwrap_or(0) != viewers
    }

    /// Zero a departing child and drop it; returns whether the sum changed
    pub fn forget(&mut self, child: PeerId) -> bool {
        let changed = self.record(child, 0);
        self.reports.remove(&child);
        changed
    }

    pub fn total(&self) -> u32 {
        self.reports.values().fold(0u32, |acc, v| acc.saturating_add(*v))
    }

    pub fn get(&self, child: PeerId) -> Option<u32> {
        self.reports.get(&child).copied()
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}

/// Count a node at `depth` reports upstream
pub fn reported_viewers(depth: Depth, downstream: usize, tally: &ViewerTally) -> u32 {
    if depth.is_viewer_facing() {
        u32::try_from(downstream).unwrap_or(u32::MAX)
    } else {
        tally.total()
    }
}
