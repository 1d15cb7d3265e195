//! Weak, soft, and phantom referents, and the finalization queue.
//!
//! Tracing never follows a referent slot. Instead every cycle collects the
//! referent slots of the reference objects it traced and, once the strong
//! graph is complete, processes them in three steps:
//!
//! 1. weak referents that were not reached are cleared, and so are soft
//!    ones when the cycle collects mature space;
//! 2. registered finalizable objects that were not reached move to the
//!    finalization queue and are traced again, which keeps them and
//!    everything they reference alive for one more round;
//! 3. every remaining unreached referent is cleared, phantom ones included.
//!
//! Processing runs on one worker before any slot is fixed up, so cleared
//! slots are never repointed.

use object::{ObjRef, ReferenceKind};

use crate::RootSlot;
use crate::remset::untag;

/// What reference processing did in one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceOutcome {
    pub cleared: usize,
    pub finalizers_queued: usize,
}

impl std::ops::AddAssign for ReferenceOutcome {
    fn add_assign(&mut self, rhs: Self) {
        self.cleared += rhs.cleared;
        self.finalizers_queued += rhs.finalizers_queued;
    }
}

/// The cycle-specific half of reference processing.
pub(crate) trait Liveness {
    /// Whether `obj` was reached, or lies in a space this cycle does not
    /// reclaim.
    fn is_reached(&self, obj: ObjRef) -> bool;

    /// Traces `obj` and everything reachable from it, appending the
    /// referent slots met on the way to `discovered`.
    fn keep_alive(&mut self, obj: ObjRef, discovered: &mut Vec<usize>);
}

// ── Finalization queue ────────────────────────────────────────────────

/// Objects whose type has a finalizer.
#[derive(Debug, Default)]
pub struct FinalizerQueue {
    /// Allocated and not yet found unreachable. Not roots.
    registered: Vec<ObjRef>,
    /// Found unreachable by the running pause.
    pending: Vec<ObjRef>,
    /// Waiting for the embedder to run their finalizers. Roots until taken.
    ready: Vec<ObjRef>,
}

impl FinalizerQueue {
    pub fn register(&mut self, obj: ObjRef) {
        debug_assert!(!obj.is_null());
        self.registered.push(obj);
    }

    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    pub fn ready(&self) -> usize {
        self.ready.len()
    }

    /// Hands the queued objects to the caller, which must keep them alive
    /// through its own roots from now on.
    pub fn take_ready(&mut self) -> Vec<ObjRef> {
        std::mem::take(&mut self.ready)
    }

    /// Root slots of the first `count` queued objects. Valid until the
    /// queue changes.
    pub(crate) fn ready_roots(&mut self, count: usize) -> impl Iterator<Item = RootSlot> + '_ {
        self.ready[..count]
            .iter_mut()
            .map(|obj| RootSlot::new(obj as *mut ObjRef))
    }

    /// Applies `f` to every registered and pending entry. Queued objects
    /// are fixed as roots instead.
    pub(crate) fn for_each_entry(&mut self, mut f: impl FnMut(*mut ObjRef)) {
        for obj in self.registered.iter_mut().chain(self.pending.iter_mut()) {
            f(obj as *mut ObjRef);
        }
    }

    /// Queues the objects the last cycle found. Returns how many.
    pub(crate) fn publish(&mut self) -> usize {
        let found = self.pending.len();
        self.ready.append(&mut self.pending);
        found
    }
}

// ── Processing ────────────────────────────────────────────────────────

/// Clears `slot` if its referent was not reached.
///
/// # Safety
///
/// `slot` must be the referent slot of a live reference object.
unsafe fn clear_unreached<L: Liveness>(liveness: &L, slot: usize) -> bool {
    let slot = slot as *mut ObjRef;
    // SAFETY: forwarded from caller
    let referent = unsafe { *slot };
    if referent.is_null() || liveness.is_reached(referent) {
        return false;
    }
    // SAFETY: see above
    unsafe { *slot = ObjRef::NULL };
    true
}

/// Processes the referent slots `discovered` by a finished trace.
/// Soft referents are only cleared with `clear_soft`.
///
/// # Safety
///
/// Every entry must name the referent slot of an object that survives the
/// cycle, with all mutators parked.
pub(crate) unsafe fn process<L: Liveness>(
    liveness: &mut L,
    mut discovered: Vec<usize>,
    finalizers: &mut FinalizerQueue,
    clear_soft: bool,
) -> ReferenceOutcome {
    let mut outcome = ReferenceOutcome::default();
    let clears = |kind: ReferenceKind| match kind {
        ReferenceKind::Strong => false,
        ReferenceKind::Soft => clear_soft,
        ReferenceKind::Weak | ReferenceKind::Phantom => true,
    };

    for &entry in &discovered {
        let (slot, kind) = untag(entry);
        // SAFETY: forwarded from caller
        if (kind == ReferenceKind::Weak || (clear_soft && kind == ReferenceKind::Soft))
            && unsafe { clear_unreached(liveness, slot) }
        {
            outcome.cleared += 1;
        }
    }

    let registered = std::mem::take(&mut finalizers.registered);
    for obj in registered {
        if liveness.is_reached(obj) {
            finalizers.registered.push(obj);
        } else {
            liveness.keep_alive(obj, &mut discovered);
            finalizers.pending.push(obj);
            outcome.finalizers_queued += 1;
        }
    }

    for &entry in &discovered {
        let (slot, kind) = untag(entry);
        // SAFETY: forwarded from caller; slots found while keeping
        // finalizable objects alive belong to objects that survive as well
        if clears(kind) && unsafe { clear_unreached(liveness, slot) } {
            outcome.cleared += 1;
        }
    }

    log::trace!(
        "references: {} referent slots, {} cleared, {} objects queued for finalization",
        discovered.len(),
        outcome.cleared,
        outcome.finalizers_queued
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remset::tag_referent;
    use rustc_hash::FxHashSet;

    /// Liveness over plain addresses; `keep_alive` reaches `children[obj]`.
    #[derive(Default)]
    struct Graph {
        reached: FxHashSet<ObjRef>,
        children: Vec<(ObjRef, ObjRef)>,
        kept: Vec<ObjRef>,
    }

    impl Liveness for Graph {
        fn is_reached(&self, obj: ObjRef) -> bool {
            self.reached.contains(&obj)
        }

        fn keep_alive(&mut self, obj: ObjRef, _discovered: &mut Vec<usize>) {
            self.kept.push(obj);
            let mut stack = vec![obj];
            while let Some(o) = stack.pop() {
                if self.reached.insert(o) {
                    stack.extend(self.children.iter().filter(|c| c.0 == o).map(|c| c.1));
                }
            }
        }
    }

    fn obj(n: usize) -> ObjRef {
        ObjRef::from_addr(n * 64)
    }

    #[test]
    fn weak_referents_are_cleared_before_finalization() {
        let mut slots = [obj(1), obj(1), obj(2)];
        let weak = tag_referent(&mut slots[0] as *mut ObjRef as usize, ReferenceKind::Weak);
        let phantom = tag_referent(&mut slots[1] as *mut ObjRef as usize, ReferenceKind::Phantom);
        let kept = tag_referent(&mut slots[2] as *mut ObjRef as usize, ReferenceKind::Weak);

        let mut graph = Graph::default();
        graph.reached.insert(obj(2));
        let mut finalizers = FinalizerQueue::default();
        finalizers.register(obj(1));
        finalizers.register(obj(2));

        let outcome =
            unsafe { process(&mut graph, vec![weak, phantom, kept], &mut finalizers, false) };

        assert_eq!(slots[0], ObjRef::NULL, "weak cleared although obj(1) is finalizable");
        assert_eq!(slots[1], obj(1), "phantom survives while obj(1) awaits finalization");
        assert_eq!(slots[2], obj(2));
        assert_eq!(graph.kept, [obj(1)]);
        assert_eq!(outcome, ReferenceOutcome { cleared: 1, finalizers_queued: 1 });
        assert_eq!(finalizers.registered(), 1);
        assert_eq!(finalizers.publish(), 1);
        assert_eq!(finalizers.take_ready(), [obj(1)]);
    }

    #[test]
    fn soft_referents_follow_the_cycle_policy() {
        let mut slot = obj(3);
        let soft = tag_referent(&mut slot as *mut ObjRef as usize, ReferenceKind::Soft);
        let mut finalizers = FinalizerQueue::default();

        let outcome =
            unsafe { process(&mut Graph::default(), vec![soft], &mut finalizers, false) };
        assert_eq!(outcome.cleared, 0);
        assert_eq!(slot, obj(3));

        let outcome = unsafe { process(&mut Graph::default(), vec![soft], &mut finalizers, true) };
        assert_eq!(outcome.cleared, 1);
        assert_eq!(slot, ObjRef::NULL);
    }

    #[test]
    fn phantom_of_unfinalizable_garbage_is_cleared() {
        let mut slot = obj(4);
        let phantom = tag_referent(&mut slot as *mut ObjRef as usize, ReferenceKind::Phantom);
        let mut finalizers = FinalizerQueue::default();
        let outcome =
            unsafe { process(&mut Graph::default(), vec![phantom], &mut finalizers, false) };
        assert_eq!(slot, ObjRef::NULL);
        assert_eq!(outcome, ReferenceOutcome { cleared: 1, finalizers_queued: 0 });
    }
}
