//! Collection-kind decision and nursery sizing.

/// Survival ratio at or above which the nursery doubles.
const GROW_SURVIVAL: f64 = 0.5;
/// Survival ratio at or below which the nursery halves.
const SHRINK_SURVIVAL: f64 = 0.1;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// Nursery or mature space could not satisfy an allocation.
    HeapExhausted,
    /// The large-object space could not satisfy an allocation.
    LargeObjectSpaceFull,
    /// The embedding runtime asked for a collection.
    ExplicitRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Evacuate the nursery into mature space.
    Minor,
    /// Mark-compact mature space, sweep the large-object space, and
    /// collect the nursery along the way.
    Major,
}

/// Picks the kind of the next cycle.
///
/// A major cycle is chosen when mature space could not absorb a full
/// evacuation of the nursery, or when large-object space ran dry, since
/// only a major cycle sweeps it. The comparison is by bytes only and does
/// not account for fragmentation; a minor cycle that still runs out of
/// promotion space falls back to marking in place and escalates.
pub fn decide_collection_kind(
    mature_free: usize,
    nursery_used: usize,
    cause: GcCause,
) -> CollectionKind {
    if mature_free < nursery_used || cause == GcCause::LargeObjectSpaceFull {
        CollectionKind::Major
    } else {
        CollectionKind::Minor
    }
}

/// Nursery size in blocks for the next cycle, after one in which
/// `survival` of the occupied nursery bytes survived.
///
/// Objects that keep surviving get a larger nursery to die in; a nursery
/// that is almost all garbage shrinks to give the memory back.
pub fn adapt_nursery_blocks(current: usize, min: usize, max: usize, survival: f64) -> usize {
    debug_assert!(min > 0 && min <= max);
    let next = if survival >= GROW_SURVIVAL {
        current.saturating_mul(2)
    } else if survival <= SHRINK_SURVIVAL {
        current / 2
    } else {
        current
    };
    next.clamp(min, max)
}
