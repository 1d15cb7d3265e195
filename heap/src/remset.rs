//! Remembered-set buffers.
//!
//! Entries are addresses of reference slots outside the nursery that held
//! a nursery reference when recorded. They are hints: a slot may have been
//! overwritten since, so consumers re-read it. Referent slots of weak,
//! soft, and phantom references carry their kind in the two low bits.

use std::mem;

use object::ReferenceKind;

const KIND_BITS: usize = 0b11;

/// Entry for the referent slot `slot` of a `kind` reference object.
#[inline(always)]
pub fn tag_referent(slot: usize, kind: ReferenceKind) -> usize {
    debug_assert_eq!(slot & KIND_BITS, 0, "misaligned slot 0x{slot:x}");
    slot | kind.code()
}

/// Slot address of an entry, and `Strong` unless it is a referent slot.
#[inline(always)]
pub fn untag(entry: usize) -> (usize, ReferenceKind) {
    (entry & !KIND_BITS, ReferenceKind::from_code(entry))
}

/// A collector's two remembered-set buffers.
///
/// The collector appends to `this_cycle` while fixing references. At the
/// end of the cycle the buffers swap by ownership and `last_cycle` is
/// handed whole to the nursery's queue, so producer and consumer never
/// share a buffer.
#[derive(Debug, Default)]
pub struct RemsetRing {
    this_cycle: Vec<usize>,
    last_cycle: Vec<usize>,
}

impl RemsetRing {
    #[inline(always)]
    pub fn record(&mut self, slot: usize) {
        self.this_cycle.push(slot);
    }

    pub fn this_cycle(&self) -> &[usize] {
        &self.this_cycle
    }

    pub fn this_cycle_mut(&mut self) -> &mut Vec<usize> {
        &mut self.this_cycle
    }

    pub fn last_cycle(&self) -> &[usize] {
        &self.last_cycle
    }

    /// Fatal unless `this_cycle` is empty; checked before a cycle starts.
    pub fn assert_this_cycle_empty(&self, collector: usize) {
        if !self.this_cycle.is_empty() {
            log::error!(
                "collector {collector}: {} remembered slots left over from a previous cycle",
                self.this_cycle.len()
            );
            panic!("collector {collector} remembered set not empty at cycle start");
        }
    }

    /// Swaps the buffers. `last_cycle` must have been handed off already.
    pub fn rotate(&mut self, collector: usize) {
        if !self.last_cycle.is_empty() {
            log::error!(
                "collector {collector}: {} remembered slots were never consumed",
                self.last_cycle.len()
            );
            panic!("collector {collector} last-cycle remembered set not empty");
        }
        mem::swap(&mut self.this_cycle, &mut self.last_cycle);
    }

    /// Gives up ownership of `last_cycle`.
    pub fn take_last_cycle(&mut self) -> Vec<usize> {
        mem::take(&mut self.last_cycle)
    }
}

/// Flattens queued buffers into a sorted, duplicate-free slot list.
pub fn merge_buffers(buffers: Vec<Vec<usize>>) -> Vec<usize> {
    let mut slots: Vec<usize> = buffers.into_iter().flatten().collect();
    slots.sort_unstable();
    slots.dedup();
    slots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_hands_off_by_swap() {
        let mut ring = RemsetRing::default();
        ring.record(0x100);
        ring.record(0x108);
        let ptr = ring.this_cycle().as_ptr();

        ring.rotate(0);
        assert!(ring.this_cycle().is_empty());
        assert_eq!(ring.last_cycle(), &[0x100, 0x108]);

        let handed = ring.take_last_cycle();
        assert_eq!(handed.as_ptr(), ptr, "buffer moved, not copied");
        assert!(ring.last_cycle().is_empty());

        ring.record(0x200);
        ring.rotate(0);
        assert_eq!(ring.take_last_cycle(), vec![0x200]);
    }

    #[test]
    #[should_panic(expected = "last-cycle remembered set not empty")]
    fn rotating_unconsumed_buffer_is_fatal() {
        let mut ring = RemsetRing::default();
        ring.record(0x100);
        ring.rotate(3);
        ring.rotate(3);
    }

    #[test]
    #[should_panic(expected = "not empty at cycle start")]
    fn leftover_entries_at_cycle_start_are_fatal() {
        let mut ring = RemsetRing::default();
        ring.record(0x100);
        ring.assert_this_cycle_empty(1);
    }

    #[test]
    fn referent_entries_keep_their_kind() {
        let entry = tag_referent(0x1018, ReferenceKind::Phantom);
        assert_ne!(entry, 0x1018);
        assert_eq!(untag(entry), (0x1018, ReferenceKind::Phantom));
        assert_eq!(untag(0x1020), (0x1020, ReferenceKind::Strong));
    }

    #[test]
    fn merge_sorts_and_dedups() {
        let merged = merge_buffers(vec![vec![0x30, 0x10], vec![], vec![0x10, 0x20]]);
        assert_eq!(merged, [0x10, 0x20, 0x30]);
    }
}
