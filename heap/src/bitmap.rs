use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use object::OBJECT_ALIGNMENT;

const GRANULE_SHIFT: u32 = OBJECT_ALIGNMENT.trailing_zeros();

/// Side bitmap with one bit per object granule of a space, flagging the
/// start addresses of objects marked live this cycle.
#[derive(Debug)]
pub struct MarkBitmap {
    base: usize,
    words: Box<[AtomicU64]>,
}

impl MarkBitmap {
    pub fn new(base: usize, len: usize) -> Self {
        let granules = len >> GRANULE_SHIFT;
        let words = (0..granules.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { base, words }
    }

    #[inline(always)]
    fn index(&self, addr: usize) -> (usize, u64) {
        debug_assert!(addr >= self.base, "address below bitmap: 0x{addr:x}");
        debug_assert!(addr.is_multiple_of(OBJECT_ALIGNMENT));
        let granule = (addr - self.base) >> GRANULE_SHIFT;
        debug_assert!(granule < self.words.len() * 64, "address past bitmap");
        (granule >> 6, 1u64 << (granule & 63))
    }

    /// Sets the bit for `addr`. Returns `true` if this call set it.
    #[inline(always)]
    pub fn set(&self, addr: usize) -> bool {
        let (word, bit) = self.index(addr);
        // SAFETY: index is bounds checked in debug builds and addr is
        // inside the space this bitmap was created for
        let word = unsafe { self.words.get_unchecked(word) };
        word.fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    #[inline(always)]
    pub fn is_set(&self, addr: usize) -> bool {
        let (word, bit) = self.index(addr);
        self.words[word].load(Ordering::Relaxed) & bit != 0
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Calls `f` with every flagged address in `range`, ascending.
    pub fn for_each_in(&self, range: Range<usize>, mut f: impl FnMut(usize)) {
        let first = (range.start.max(self.base) - self.base) >> GRANULE_SHIFT;
        let last = (range.end.saturating_sub(self.base) >> GRANULE_SHIFT)
            .min(self.words.len() * 64);
        if first >= last {
            return;
        }

        let mut word_idx = first >> 6;
        while word_idx * 64 < last {
            let lo = word_idx * 64;
            let mut bits = self.words[word_idx].load(Ordering::Relaxed);
            if lo < first {
                bits &= !0u64 << (first - lo);
            }
            if lo + 64 > last {
                bits &= (1u64 << (last - lo)) - 1;
            }
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(self.base + ((lo + bit) << GRANULE_SHIFT));
                bits &= bits - 1;
            }
            word_idx += 1;
        }
    }
}
