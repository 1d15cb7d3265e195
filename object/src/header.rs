use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ObjRef, TypeInfo};

/// Mark bit kept in the vtable word. Used by mark-in-place tracing; it
/// never flips and must be cleared again before mutators resume.
pub const CONST_MARK_BIT: usize = 0b1;
/// Both flip bits of the info word.
pub const DUAL_MARKBITS: usize = 0b11;
pub const DUAL_MARKBITS_MASK: usize = !DUAL_MARKBITS;

/// Which info-word bit means "marked" and which means "forwarded" in the
/// current cycle.
///
/// The assignment swaps after every cycle that marks through the info word,
/// so the previous cycle's mark bit reads as this cycle's forward bit and
/// no pass is needed to clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkParity {
    mark: usize,
    forward: usize,
}

impl MarkParity {
    pub const INITIAL: Self = Self {
        mark: 0b01,
        forward: 0b10,
    };

    /// Parity used by the `n`th flipping cycle, counting from zero.
    #[inline(always)]
    pub const fn for_cycle(n: usize) -> Self {
        if n % 2 == 0 {
            Self::INITIAL
        } else {
            Self::INITIAL.flipped()
        }
    }

    #[inline(always)]
    pub const fn mark_bit(self) -> usize {
        self.mark
    }

    #[inline(always)]
    pub const fn forward_bit(self) -> usize {
        self.forward
    }

    #[inline(always)]
    pub const fn flipped(self) -> Self {
        Self {
            mark: self.forward,
            forward: self.mark,
        }
    }
}

impl Default for MarkParity {
    fn default() -> Self {
        Self::INITIAL
    }
}

/// Decoded GC state of the info word under a given parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoTag {
    Unmarked,
    Marked,
    Forwarded(ObjRef),
}

impl InfoTag {
    /// Decodes a raw info word.
    #[inline(always)]
    pub fn of(raw: usize, parity: MarkParity) -> Self {
        if raw & DUAL_MARKBITS == DUAL_MARKBITS {
            InfoTag::Forwarded(ObjRef::from_addr(raw & DUAL_MARKBITS_MASK))
        } else if raw & parity.mark_bit() != 0 {
            InfoTag::Marked
        } else {
            InfoTag::Unmarked
        }
    }
}

/// The two-word header at the start of every heap object.
///
/// ```text
/// word 0 (vt):   [&'static TypeInfo address] | const mark bit (bit 0)
/// word 1 (info): [hash / monitor bits ... ]  | flip bits (bits 0..1)
///                or, while forwarded:
///                [forwarding address]        | 0b11
/// ```
///
/// A forwarded header only exists between the copy of an object and the end
/// of the same collection cycle.
#[repr(C)]
pub struct Header {
    vt: AtomicUsize,
    info: AtomicUsize,
}

const _: () = assert!(size_of::<Header>() == 16);

impl Header {
    pub const SIZE: usize = size_of::<Header>();

    pub fn new(ty: &'static TypeInfo) -> Self {
        let vt = ty as *const TypeInfo as usize;
        debug_assert_eq!(vt & CONST_MARK_BIT, 0, "type info not aligned");
        Self {
            vt: AtomicUsize::new(vt),
            info: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn type_info(&self) -> &'static TypeInfo {
        let raw = self.vt.load(Ordering::Relaxed) & !CONST_MARK_BIT;
        debug_assert_ne!(raw, 0, "object without type info");
        // SAFETY: vt always holds the address of a leaked, immutable TypeInfo
        unsafe { &*(raw as *const TypeInfo) }
    }

    #[inline(always)]
    pub fn vt_raw(&self) -> usize {
        self.vt.load(Ordering::Relaxed)
    }

    // ── vtable mark ────────────────────────────────────────────────

    #[inline(always)]
    pub fn is_marked_in_vt(&self) -> bool {
        self.vt.load(Ordering::Relaxed) & CONST_MARK_BIT != 0
    }

    /// Sets the vtable mark bit. Returns `true` if this call marked it.
    #[inline(always)]
    pub fn mark_in_vt(&self) -> bool {
        self.vt.fetch_or(CONST_MARK_BIT, Ordering::Relaxed) & CONST_MARK_BIT == 0
    }

    #[inline(always)]
    pub fn unmark_in_vt(&self) {
        self.vt.fetch_and(!CONST_MARK_BIT, Ordering::Relaxed);
    }

    // ── info word ──────────────────────────────────────────────────

    /// The info word as the execution engine sees it (flip bits stripped).
    #[inline(always)]
    pub fn info(&self) -> usize {
        self.info.load(Ordering::Relaxed) & DUAL_MARKBITS_MASK
    }

    #[inline(always)]
    pub fn info_raw(&self) -> usize {
        self.info.load(Ordering::Relaxed)
    }

    /// Replaces the engine-visible info bits. `info` must keep its two low
    /// bits clear; the current flip bits are preserved.
    #[inline(always)]
    pub fn set_info(&self, info: usize) {
        debug_assert_eq!(info & DUAL_MARKBITS, 0, "info clobbers flip bits");
        let mut cur = self.info.load(Ordering::Relaxed);
        loop {
            let next = info | (cur & DUAL_MARKBITS);
            match self.info.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    #[inline(always)]
    pub fn tag(&self, parity: MarkParity) -> InfoTag {
        InfoTag::of(self.info.load(Ordering::Acquire), parity)
    }

    #[inline(always)]
    pub fn is_marked_in_info(&self, parity: MarkParity) -> bool {
        self.info.load(Ordering::Relaxed) & parity.mark_bit() != 0
    }

    /// Only meaningful together with [`Header::is_moved`]: a header marked
    /// in the previous cycle shows this bit as well.
    #[inline(always)]
    pub fn is_forward_bit_set(&self, parity: MarkParity) -> bool {
        self.info.load(Ordering::Relaxed) & parity.forward_bit() != 0
    }

    /// Both flip bits set: the object was copied this cycle and the info
    /// word holds its new address.
    #[inline(always)]
    pub fn is_moved(&self) -> bool {
        self.info.load(Ordering::Relaxed) & DUAL_MARKBITS == DUAL_MARKBITS
    }

    /// Marks the object in place for this cycle, dropping the stale bit left
    /// behind by the previous one. Returns `true` if this call marked it.
    #[inline(always)]
    pub fn mark_in_info(&self, parity: MarkParity) -> bool {
        let mut cur = self.info.load(Ordering::Relaxed);
        loop {
            debug_assert_ne!(
                cur & DUAL_MARKBITS,
                DUAL_MARKBITS,
                "marking a forwarded object"
            );
            if cur & parity.mark_bit() != 0 {
                return false;
            }
            let next = (cur & DUAL_MARKBITS_MASK) | parity.mark_bit();
            match self.info.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Marks the object in place if the info word still reads `expected`.
    /// Otherwise returns the word found instead.
    #[inline(always)]
    pub fn try_mark_in_info(&self, expected: usize, parity: MarkParity) -> Result<(), usize> {
        debug_assert_ne!(expected & DUAL_MARKBITS, DUAL_MARKBITS, "marking a forwarded object");
        let next = (expected & DUAL_MARKBITS_MASK) | parity.mark_bit();
        self.info
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    /// Installs a forwarding pointer to `dest`. The previous info bits must
    /// already have been copied to the destination header.
    #[inline(always)]
    pub fn set_forwarding(&self, dest: ObjRef) {
        debug_assert!(!dest.is_null());
        debug_assert_eq!(dest.addr() & DUAL_MARKBITS, 0);
        self.info
            .store(dest.addr() | DUAL_MARKBITS, Ordering::Release);
    }

    /// Claims the object for a copy at `dest`, provided the info word
    /// still reads `expected`, the value the copy was taken from. A worker
    /// that loses the race gets the winner's word back.
    #[inline(always)]
    pub fn try_forward(&self, expected: usize, dest: ObjRef) -> Result<(), usize> {
        debug_assert!(!dest.is_null());
        debug_assert_eq!(dest.addr() & DUAL_MARKBITS, 0);
        self.info
            .compare_exchange(
                expected,
                dest.addr() | DUAL_MARKBITS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    /// Writes an unmarked copy of this header to `dest`, taking the info
    /// word from `info`, a value loaded from this header earlier.
    ///
    /// # Safety
    ///
    /// `dest` must be valid for writing a header.
    #[inline(always)]
    pub unsafe fn copy_to(&self, dest: *mut Header, info: usize) {
        debug_assert_ne!(info & DUAL_MARKBITS, DUAL_MARKBITS, "copying a forwarding word");
        let copy = Header {
            vt: AtomicUsize::new(self.vt_raw() & !CONST_MARK_BIT),
            info: AtomicUsize::new(info & DUAL_MARKBITS_MASK),
        };
        // SAFETY: caller guarantees a writable header slot
        unsafe { dest.write(copy) };
    }

    #[inline(always)]
    pub fn forwarding(&self) -> ObjRef {
        let raw = self.info.load(Ordering::Acquire);
        debug_assert_eq!(raw & DUAL_MARKBITS, DUAL_MARKBITS, "not forwarded");
        let dest = raw & DUAL_MARKBITS_MASK;
        assert!(dest > DUAL_MARKBITS, "illegal forwarding pointer 0x{raw:x}");
        ObjRef::from_addr(dest)
    }

    /// Drops every GC bit (vtable mark and both flip bits).
    #[inline(always)]
    pub fn clear_gc_bits(&self) {
        self.vt.fetch_and(!CONST_MARK_BIT, Ordering::Relaxed);
        self.info.fetch_and(DUAL_MARKBITS_MASK, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let raw = self.info_raw();
        if raw & DUAL_MARKBITS == DUAL_MARKBITS {
            return f
                .debug_struct("Header")
                .field("forwarded_to", &(raw & DUAL_MARKBITS_MASK))
                .finish();
        }
        f.debug_struct("Header")
            .field("type", &self.type_info().name())
            .field("vt_mark", &self.is_marked_in_vt())
            .field("info", &format_args!("0x{raw:x}"))
            .finish()
    }
}
