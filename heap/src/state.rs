use std::sync::atomic::{AtomicU64, Ordering};

use crate::GcCause;

/// A pending collection: why it was requested and whether the requester
/// insists on a major cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRequest {
    pub cause: GcCause,
    pub force_major: bool,
}

impl GcRequest {
    pub const fn new(cause: GcCause) -> Self {
        Self {
            cause,
            force_major: false,
        }
    }

    pub const fn major(cause: GcCause) -> Self {
        Self {
            cause,
            force_major: true,
        }
    }

    #[inline(always)]
    fn encode(self) -> u64 {
        let cause = match self.cause {
            GcCause::HeapExhausted => 1,
            GcCause::LargeObjectSpaceFull => 2,
            GcCause::ExplicitRequest => 3,
        };
        cause | ((self.force_major as u64) << 2)
    }

    #[inline(always)]
    fn decode(bits: u64) -> Option<Self> {
        let cause = match bits & 0b11 {
            1 => GcCause::HeapExhausted,
            2 => GcCause::LargeObjectSpaceFull,
            3 => GcCause::ExplicitRequest,
            _ => return None,
        };
        Some(Self {
            cause,
            force_major: bits & 0b100 != 0,
        })
    }
}

/// Collection state shared by all mutators, packed into one word:
/// `request (3 bits) | cycle (29 bits) | registered threads (32 bits)`.
///
/// A request of zero means no collection is in progress.
#[derive(Debug)]
pub struct GcState(AtomicU64);

impl GcState {
    const STATUS_MASK: u64 = 0b111;
    const CYCLE_SHIFT: u32 = 3;
    const CYCLE_MASK: u64 = (1u64 << 29) - 1; // 29 bits
    const THREADS_SHIFT: u32 = 32;

    #[inline(always)]
    fn pack(request: Option<GcRequest>, cycle: u32, threads: u32) -> u64 {
        debug_assert!((cycle as u64) <= Self::CYCLE_MASK);
        request.map_or(0, GcRequest::encode)
            | ((cycle as u64) << Self::CYCLE_SHIFT)
            | ((threads as u64) << Self::THREADS_SHIFT)
    }

    #[inline(always)]
    fn unpack(word: u64) -> (Option<GcRequest>, u32, u32) {
        let request = GcRequest::decode(word & Self::STATUS_MASK);
        let cycle = ((word >> Self::CYCLE_SHIFT) & Self::CYCLE_MASK) as u32;
        let threads = (word >> Self::THREADS_SHIFT) as u32;
        (request, cycle, threads)
    }

    pub fn new() -> Self {
        Self(AtomicU64::new(Self::pack(None, 0, 0)))
    }

    #[inline(always)]
    pub fn load(&self, ord: Ordering) -> (Option<GcRequest>, u32, u32, u64) {
        let w = self.0.load(ord);
        let (r, c, t) = Self::unpack(w);
        (r, c, t, w)
    }

    #[inline(always)]
    pub fn is_collecting(&self) -> bool {
        self.0.load(Ordering::Acquire) & Self::STATUS_MASK != 0
    }

    /// Register a mutator thread. Waits out a running collection.
    pub fn register_thread(&self) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, cycle, threads, cur) = self.load(Acquire);
            if request.is_some() {
                std::thread::yield_now();
                continue;
            }
            let Some(new_threads) = threads.checked_add(1) else {
                panic!("thread count overflow");
            };
            let next = Self::pack(None, cycle, new_threads);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return;
            }
        }
    }

    /// Deregister a mutator thread. Fails while a collection is running,
    /// in which case the caller must first take part in it.
    pub fn try_deregister_thread(&self) -> bool {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, cycle, threads, cur) = self.load(Acquire);
            if request.is_some() {
                return false;
            }
            let Some(new_threads) = threads.checked_sub(1) else {
                panic!("thread count underflow");
            };
            let next = Self::pack(None, cycle, new_threads);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return true;
            }
        }
    }

    /// Attempt to start a cycle (coordinator election).
    /// Returns (is_coordinator, active request, cycle, participants)
    pub fn try_start_gc(&self, requested: GcRequest) -> (bool, GcRequest, u32, u32) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, cycle, threads, cur) = self.load(Acquire);
            if let Some(active) = request {
                return (false, active, cycle, threads);
            }
            let new_cycle = cycle.wrapping_add(1) & (Self::CYCLE_MASK as u32);
            let next = Self::pack(Some(requested), new_cycle, threads);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return (true, requested, new_cycle, threads);
            }
        }
    }

    /// End the cycle (coordinator only). Leaves cycle and threads unchanged.
    pub fn finish_gc(&self) {
        use std::sync::atomic::Ordering::*;
        loop {
            let (request, cycle, threads, cur) = self.load(Acquire);
            if request.is_none() {
                return;
            }
            let next = Self::pack(None, cycle, threads);
            if self.0.compare_exchange(cur, next, AcqRel, Acquire).is_ok() {
                return;
            }
        }
    }
}

impl Default for GcState {
    fn default() -> Self {
        Self::new()
    }
}
