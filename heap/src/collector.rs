//! Per-worker collector state and the parallel phase driver.

use object::ObjRef;
use parking_lot::Mutex;

use crate::{BlockSpace, RemsetRing, Tlab};

/// Pushes between two offers of local work to the shared pool.
pub const SHARE_INTERVAL: usize = 256;
/// A worker keeps this many entries to itself.
const MIN_SHARE: usize = 4;

/// State owned by one collector worker.
///
/// Records persist across cycles so buffers keep their capacity; only the
/// remembered-set ring carries data from one cycle into the next.
#[derive(Debug)]
pub struct Collector {
    pub id: usize,
    pub mark_stack: Vec<ObjRef>,
    pub remset: RemsetRing,
    /// Referent slots of reference objects traced this cycle, tagged with
    /// their kind.
    pub discovered: Vec<usize>,
    /// Allocation context for objects promoted into mature space.
    promotion: Tlab,
    /// Mature blocks this worker promoted into during the running cycle.
    promoted_blocks: Vec<usize>,
    promoted_bytes: usize,
}

impl Collector {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            mark_stack: Vec::with_capacity(256),
            remset: RemsetRing::default(),
            discovered: Vec::new(),
            promotion: Tlab::default(),
            promoted_blocks: Vec::new(),
            promoted_bytes: 0,
        }
    }

    /// Reserves `size` bytes of mature space for a promoted object.
    pub fn promote_alloc(&mut self, mature: &BlockSpace, size: usize) -> Option<usize> {
        if let Some(addr) = self.promotion.bump(size) {
            self.promoted_bytes += size;
            return Some(addr);
        }
        let block = mature.refill(&mut self.promotion)?;
        self.promoted_blocks.push(block);
        let addr = self.promotion.bump(size)?;
        self.promoted_bytes += size;
        Some(addr)
    }

    /// Gives back the latest promotion, at `addr`, after another worker
    /// copied the same object first.
    pub fn undo_promote(&mut self, addr: usize, size: usize) {
        self.promotion.unbump(addr, size);
        self.promoted_bytes -= size;
    }

    /// Publishes the frontier of the promotion block.
    pub fn finish_promotion(&mut self, mature: &BlockSpace) {
        mature.retire(&mut self.promotion);
    }

    pub fn promoted_blocks(&self) -> &[usize] {
        &self.promoted_blocks
    }

    pub fn promoted_bytes(&self) -> usize {
        self.promoted_bytes
    }

    /// Drops per-cycle scratch state. The remembered-set ring is rotated
    /// separately.
    pub fn reset_cycle(&mut self) {
        debug_assert!(self.mark_stack.is_empty(), "mark stack not drained");
        debug_assert!(self.promotion.block().is_none(), "promotion block not retired");
        debug_assert!(self.discovered.is_empty(), "discovered references not processed");
        self.mark_stack.clear();
        self.discovered.clear();
        self.promoted_blocks.clear();
        self.promoted_bytes = 0;
    }
}

// ── Work sharing ──────────────────────────────────────────────────────

#[derive(Debug)]
struct PoolState {
    objects: Vec<ObjRef>,
    /// Workers that may still produce work.
    active: usize,
}

/// Grey objects shared between the workers of one tracing phase.
///
/// A worker offers half of its stack every [`SHARE_INTERVAL`] pushes and
/// refills from the pool once its stack runs dry. The phase is over when
/// the pool is empty and no worker is active; both are checked under the
/// same lock, so no work can appear afterwards.
#[derive(Debug)]
pub struct WorkPool {
    state: Mutex<PoolState>,
    sharing: bool,
}

impl WorkPool {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                objects: Vec::new(),
                active: workers,
            }),
            sharing: workers > 1,
        }
    }

    /// Moves the older half of `local` to the pool.
    pub fn share(&self, local: &mut Vec<ObjRef>) {
        if !self.sharing || local.len() <= MIN_SHARE {
            return;
        }
        let half = local.len() / 2;
        self.state.lock().objects.extend(local.drain(..half));
    }

    /// Refills the empty `local` stack. Returns `false` once the phase has
    /// run out of work for good.
    pub fn steal(&self, local: &mut Vec<ObjRef>) -> bool {
        debug_assert!(local.is_empty());
        let mut idle = false;
        loop {
            {
                let mut state = self.state.lock();
                if !state.objects.is_empty() {
                    let take = state.objects.len().div_ceil(2);
                    let at = state.objects.len() - take;
                    local.extend(state.objects.drain(at..));
                    if idle {
                        state.active += 1;
                    }
                    return true;
                }
                if !idle {
                    state.active -= 1;
                    idle = true;
                }
                if state.active == 0 {
                    return false;
                }
            }
            std::thread::yield_now();
        }
    }
}

/// Runs `f` once per collector, each on its own thread, and returns when
/// all are done. A single collector runs on the calling thread.
///
/// Workers split work by index: worker `id` of `n` takes item `i` when
/// `i % n == id`.
pub fn run_parallel<F>(collectors: &mut [Collector], f: F)
where
    F: Fn(&mut Collector, usize) + Sync,
{
    let n = collectors.len();
    if n == 1 {
        f(&mut collectors[0], 1);
        return;
    }

    let f = &f;
    std::thread::scope(|s| {
        for collector in collectors.iter_mut() {
            s.spawn(move || f(collector, n));
        }
    });
}

/// Whether item `index` belongs to worker `id` of `n`.
#[inline(always)]
pub fn owns(index: usize, id: usize, n: usize) -> bool {
    index % n == id
}
