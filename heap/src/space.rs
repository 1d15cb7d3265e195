/// The three regions carved from the heap reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Young generation. Bump allocated, evacuated by copying.
    Nursery,
    /// Old generation. Receives promoted objects, mark-compacted.
    Mature,
    /// Objects at or above the large-object threshold. Never moved,
    /// reclaimed by sweeping.
    LargeObject,
}

/// Per-space collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SpaceStats {
    /// Cycles that collected this space.
    pub num_collections: usize,
    /// Surviving bytes over occupied bytes, as of the last collection of
    /// this space.
    pub survival_ratio: f64,
}

impl SpaceStats {
    pub(crate) fn record(&mut self, survived: usize, occupied: usize) {
        self.num_collections += 1;
        self.survival_ratio = if occupied == 0 {
            0.0
        } else {
            survived as f64 / occupied as f64
        };
    }
}
