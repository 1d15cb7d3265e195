use std::time::Duration;

use crate::{CollectionKind, GcCause, Space, SpaceStats};

/// What one collection pause did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleStats {
    pub cycle: u32,
    /// Kind that finished the pause. A minor cycle that fell back to
    /// marking in place reports `Major`.
    pub kind: CollectionKind,
    pub cause: GcCause,
    pub pause: Duration,
    pub nursery_used_before: usize,
    pub promoted_bytes: usize,
    pub freed_los_bytes: usize,
    pub live_bytes_after: usize,
    /// Objects a minor cycle could not promote.
    pub fallback: usize,
    /// Weak, soft, and phantom referents cleared.
    pub cleared_references: usize,
    /// Unreachable finalizable objects moved to the finalization queue.
    pub finalizers_queued: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    pub collections: usize,
    pub minor: usize,
    pub major: usize,
    pub last: Option<CycleStats>,
    pub nursery: SpaceStats,
    pub mature: SpaceStats,
    pub large_object: SpaceStats,
    /// Cycles whose before/after verification disagreed.
    pub verification_failures: usize,
}

impl HeapStats {
    pub fn space(&self, space: Space) -> &SpaceStats {
        match space {
            Space::Nursery => &self.nursery,
            Space::Mature => &self.mature,
            Space::LargeObject => &self.large_object,
        }
    }

    pub(crate) fn space_mut(&mut self, space: Space) -> &mut SpaceStats {
        match space {
            Space::Nursery => &mut self.nursery,
            Space::Mature => &mut self.mature,
            Space::LargeObject => &mut self.large_object,
        }
    }

    pub(crate) fn record(&mut self, cycle: CycleStats) {
        self.collections += 1;
        match cycle.kind {
            CollectionKind::Minor => self.minor += 1,
            CollectionKind::Major => self.major += 1,
        }
        self.last = Some(cycle);
    }
}
