use heap::{
    CollectionKind, GcCause, GcRequest, Heap, HeapError, HeapSettings, OS_PAGE_SIZE, Partition,
    Space, reserve_degrading, reserve_memory, unmap_memory,
};
use object::{ObjRef, ReferenceKind, TypeBuilder, TypeInfo};

const BLOCK: usize = 4 * OS_PAGE_SIZE;
const NEXT: usize = 16;
const OTHER: usize = 24;
const REFERENT: usize = 16;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_test_settings() -> HeapSettings {
    HeapSettings {
        min_heap_size: 1024 * 1024,
        max_heap_size: 4 * 1024 * 1024,
        min_nursery_size: 64 * 1024,
        max_nursery_size: 256 * 1024,
        adaptive_nursery: true,
        block_size: BLOCK,
        large_object_threshold: 4096,
        num_collectors: 2,
        generational: true,
        verify_heap: true,
        reserve_step: 1024 * 1024,
    }
}

/// Two references and one payload word at offset 32.
fn node() -> &'static TypeInfo {
    TypeBuilder::object("Node").fields(2, 1).leak().unwrap()
}

/// An object of exactly `size` bytes without references.
fn blob(size: usize) -> &'static TypeInfo {
    let words = (size - 16) / 8;
    TypeBuilder::object("Blob").fields(0, words as u32).leak().unwrap()
}

/// A reference object of `kind` with just the referent at offset 16.
fn reference(kind: ReferenceKind) -> &'static TypeInfo {
    TypeBuilder::object("Reference").referent(kind).leak().unwrap()
}

/// One reference at offset 16, a payload word at 24, and a finalizer.
fn resource() -> &'static TypeInfo {
    TypeBuilder::object("Resource").fields(1, 1).finalizer().leak().unwrap()
}

fn ref_array() -> &'static TypeInfo {
    TypeBuilder::array("Object[]", 8, true).leak().unwrap()
}

fn byte_array() -> &'static TypeInfo {
    TypeBuilder::array("byte[]", 1, false).leak().unwrap()
}

unsafe fn payload(obj: ObjRef, offset: usize) -> u64 {
    unsafe { *((obj.addr() + offset) as *const u64) }
}

unsafe fn set_payload(obj: ObjRef, offset: usize, value: u64) {
    unsafe { *((obj.addr() + offset) as *mut u64) = value };
}

/// Walks a `NEXT` chain, returning the payloads in order.
unsafe fn chain_payloads(mut cur: ObjRef) -> Vec<u64> {
    let mut out = Vec::new();
    while !cur.is_null() {
        out.push(unsafe { payload(cur, 32) });
        cur = unsafe { *cur.slot(NEXT) };
    }
    out
}

// ── Minor collection ──────────────────────────────────────────────────

#[test]
fn thousand_reachable_objects_survive_minor() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];
    let ty = node();

    for i in 0..1000u64 {
        let obj = m.allocate(ty, &mut roots).unwrap();
        unsafe {
            set_payload(obj, 32, i);
            m.write_ref(obj, NEXT, roots[0]);
        }
        roots[0] = obj;
    }
    let first_head = roots[0];
    let mature_before = heap.mature.used_bytes();

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);

    let last = heap.last_cycle().unwrap();
    assert_eq!(last.kind, CollectionKind::Minor);
    assert_eq!(last.nursery_used_before, 1000 * ty.instance_size());
    assert_eq!(last.promoted_bytes, 1000 * ty.instance_size());
    assert_eq!(heap.nursery.used_bytes(), 0);
    assert_eq!(heap.mature.used_bytes() - mature_before, 1000 * ty.instance_size());
    assert_ne!(roots[0], first_head, "head was moved");

    let payloads = unsafe { chain_payloads(roots[0]) };
    assert_eq!(payloads, (0..1000).rev().collect::<Vec<_>>());
    let mut cur = roots[0];
    while !cur.is_null() {
        assert_eq!(heap.space_of(cur.addr()), Some(Space::Mature));
        cur = unsafe { m.read_ref(cur, NEXT) };
    }
    assert_eq!(heap.stats().verification_failures, 0);
}

#[test]
fn parallel_minor_promotes_shared_objects_once() {
    init_logger();
    let settings = HeapSettings {
        num_collectors: 4,
        ..create_test_settings()
    };
    let heap = Heap::new(settings).unwrap();
    let mut m = heap.mutator();
    let ty = node();
    let (holders, leaves) = (400, 200);
    let shared = |i: usize| (i * 7 + 3) % leaves;

    for round in 0..5 {
        // holders owned by different collectors race for the same leaves
        let mut roots: Vec<ObjRef> = Vec::new();
        let mut young = Vec::new();
        for i in 0..leaves {
            let leaf = m.allocate(ty, &mut roots).unwrap();
            unsafe { set_payload(leaf, 32, i as u64) };
            young.push(leaf);
        }
        for i in 0..holders {
            let holder = m.allocate(ty, &mut roots).unwrap();
            unsafe {
                m.write_ref(holder, NEXT, young[i % leaves]);
                m.write_ref(holder, OTHER, young[shared(i)]);
            }
            roots.push(holder);
        }

        m.trigger_collection(GcCause::ExplicitRequest, &mut roots);

        let last = heap.last_cycle().unwrap();
        assert_eq!(last.kind, CollectionKind::Minor, "round {round}");
        assert_eq!(last.promoted_bytes, (holders + leaves) * ty.instance_size());
        assert_eq!(heap.nursery.used_bytes(), 0);

        let copies: Vec<ObjRef> = (0..leaves)
            .map(|i| unsafe { m.read_ref(roots[i], NEXT) })
            .collect();
        for (i, &copy) in copies.iter().enumerate() {
            assert_eq!(heap.space_of(copy.addr()), Some(Space::Mature));
            assert_eq!(unsafe { payload(copy, 32) }, i as u64);
        }
        for (i, &holder) in roots.iter().enumerate() {
            assert_eq!(heap.space_of(holder.addr()), Some(Space::Mature));
            assert_eq!(unsafe { m.read_ref(holder, NEXT) }, copies[i % leaves]);
            assert_eq!(unsafe { m.read_ref(holder, OTHER) }, copies[shared(i)]);
        }
    }
    assert_eq!(heap.stats().verification_failures, 0);
}

#[test]
fn unreachable_object_memory_is_reused() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots: Vec<ObjRef> = Vec::new();

    let dropped = m.allocate(node(), &mut roots).unwrap();
    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
    assert_eq!(heap.last_cycle().unwrap().promoted_bytes, 0);

    let reused = m.allocate(node(), &mut roots).unwrap();
    assert_eq!(reused, dropped);
}

#[test]
fn old_to_young_reference_is_updated_by_minor() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL; 2];
    let ty = node();

    roots[0] = m.allocate_in(Space::Mature, ty, &mut roots).unwrap();
    roots[1] = m.allocate_array(ref_array(), 600, &mut roots).unwrap();
    assert_eq!(heap.space_of(roots[1].addr()), Some(Space::LargeObject));

    // only reachable through the remembered slots
    let young = m.allocate(ty, &mut roots).unwrap();
    unsafe {
        set_payload(young, 32, 77);
        m.write_ref(roots[0], OTHER, young);
        m.write_element(roots[1], 599, young);
    }

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
    assert_eq!(heap.last_cycle().unwrap().kind, CollectionKind::Minor);

    let from_mature = unsafe { m.read_ref(roots[0], OTHER) };
    let from_large = unsafe { m.read_element(roots[1], 599) };
    assert_eq!(from_mature, from_large);
    assert_eq!(heap.space_of(from_mature.addr()), Some(Space::Mature));
    assert_eq!(unsafe { payload(from_mature, 32) }, 77);
    assert_eq!(heap.pending_remembered(), 0, "minor consumes the remembered set");
}

#[test]
fn nursery_exhaustion_triggers_minor_cycles() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];
    let ty = node();

    roots[0] = m.allocate(ty, &mut roots).unwrap();
    unsafe { set_payload(roots[0], 32, 5) };
    for _ in 0..20_000 {
        m.allocate(ty, &mut roots).unwrap();
    }

    let stats = heap.stats();
    assert!(stats.minor >= 2, "{stats:?}");
    assert_eq!(stats.major, 0);
    assert_eq!(stats.last.unwrap().cause, GcCause::HeapExhausted);
    assert_eq!(unsafe { payload(roots[0], 32) }, 5);
    assert!(stats.nursery.survival_ratio < 0.1);
}

// ── Large objects ─────────────────────────────────────────────────────

#[test]
fn large_object_is_never_copied_and_is_swept() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];
    let ty = byte_array();

    let big = m.allocate_array(ty, 10_000, &mut roots).unwrap();
    roots[0] = big;
    let size = ty.array_size(10_000);
    assert_eq!(heap.space_of(big.addr()), Some(Space::LargeObject));

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
    assert_eq!(heap.last_cycle().unwrap().kind, CollectionKind::Minor);
    assert_eq!(roots[0], big);

    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);
    assert_eq!(roots[0], big);
    assert_eq!(heap.los.object_count(), 1);

    roots.clear();
    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);
    assert_eq!(heap.last_cycle().unwrap().freed_los_bytes, size);
    assert_eq!(heap.los.object_count(), 0);

    let again = m.allocate_array(ty, 10_000, &mut roots).unwrap();
    assert_eq!(again, big, "swept memory is reused");
}

#[test]
fn swept_neighbours_coalesce() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots: Vec<ObjRef> = Vec::new();
    let ty = byte_array();

    let a = m.allocate_array(ty, 8000, &mut roots).unwrap();
    let b = m.allocate_array(ty, 8000, &mut roots).unwrap();
    let c = m.allocate_array(ty, 8000, &mut roots).unwrap();
    assert!(a < b && b < c);
    assert_eq!(heap.los.free_areas(), 1);

    m.trigger_collection(GcCause::LargeObjectSpaceFull, &mut roots);
    assert_eq!(heap.last_cycle().unwrap().kind, CollectionKind::Major);
    assert_eq!(heap.los.free_areas(), 1);
    assert_eq!(heap.los.free_bytes(), heap.los.len());

    let merged = m.allocate_array(ty, 3 * 8000, &mut roots).unwrap();
    assert_eq!(merged, a);
}

#[test]
fn oversized_requests_report_out_of_memory() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots: Vec<ObjRef> = Vec::new();

    let len = 2 * heap.los.len();
    let err = m.allocate_array(byte_array(), len, &mut roots).unwrap_err();
    assert_eq!(
        err,
        HeapError::OutOfMemory {
            space: Space::LargeObject,
            requested: byte_array().array_size(len),
        }
    );
    assert_eq!(heap.stats().major, 2, "collect, then force a major, then give up");

    assert!(matches!(
        m.allocate(byte_array(), &mut roots),
        Err(HeapError::InvalidType(_))
    ));
    assert!(matches!(
        m.allocate_array(node(), 4, &mut roots),
        Err(HeapError::InvalidType(_))
    ));
}

// ── Major collection and escalation ───────────────────────────────────

#[test]
fn major_compacts_mature_space() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL; 2];
    let filler = blob(2048);

    for i in 0..64u64 {
        let obj = m.allocate_in(Space::Mature, filler, &mut roots).unwrap();
        unsafe { set_payload(obj, 16, i) };
        if i == 40 {
            roots[0] = obj;
        }
        if i == 63 {
            roots[1] = obj;
        }
    }
    let mature_blocks = heap.mature.used_blocks();
    assert_eq!(mature_blocks, 8);

    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);

    assert_eq!(heap.mature.used_blocks(), 1);
    assert_eq!(roots[0].addr(), heap.mature.start());
    assert_eq!(roots[1].addr(), heap.mature.start() + 2048);
    assert_eq!(unsafe { payload(roots[0], 16) }, 40);
    assert_eq!(unsafe { payload(roots[1], 16) }, 63);
    assert_eq!(heap.mature.committed_bytes(), BLOCK, "freed blocks decommitted");
    assert_eq!(heap.space_stats(Space::Mature).survival_ratio, 2.0 / 64.0);
}

#[test]
fn fragmented_mature_falls_back_and_escalates() {
    init_logger();
    // one collector promotes in root order
    let settings = HeapSettings {
        num_collectors: 1,
        ..create_test_settings()
    };
    let heap = Heap::new(settings).unwrap();
    let mut m = heap.mutator();
    let mut roots: Vec<ObjRef> = Vec::new();
    let (small, big, filler) = (blob(64), blob(4080), blob(2048));

    let holder = m.allocate_array(ref_array(), 600, &mut roots).unwrap();
    roots.push(holder);

    // leave exactly four mature blocks free
    let free_blocks = 4;
    let fill = (heap.mature.num_blocks() - free_blocks) * (BLOCK / 2048);
    for _ in 0..fill {
        let obj = m.allocate_in(Space::Mature, filler, &mut roots).unwrap();
        roots.push(obj);
    }
    assert_eq!(heap.mature.free_blocks(), free_blocks);

    // four nursery blocks, each packed exactly by four bigs and a small
    let mut smalls = Vec::new();
    let mut bigs = Vec::new();
    for _ in 0..4 {
        for _ in 0..4 {
            let b = m.allocate(big, &mut roots).unwrap();
            unsafe { set_payload(b, 16, 1000 + bigs.len() as u64) };
            bigs.push(b);
        }
        let s = m.allocate(small, &mut roots).unwrap();
        unsafe { set_payload(s, 16, smalls.len() as u64) };
        smalls.push(s);
    }
    let young_start = roots.len();
    roots.extend(&smalls);
    roots.extend(&bigs);
    let last_big = roots.len() - 1;
    unsafe { m.write_element(holder, 0, bigs[15]) };

    // promoting smalls first wastes block tails, so the last big no longer fits
    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);

    let last = heap.last_cycle().unwrap();
    assert_eq!(last.nursery_used_before, free_blocks * BLOCK);
    assert_eq!(last.fallback, 1);
    assert_eq!(last.kind, CollectionKind::Major);
    let stats = heap.stats();
    assert_eq!(stats.verification_failures, 0);
    assert_eq!(stats.nursery.num_collections, 1, "one pause, one nursery record");
    assert_eq!(stats.mature.num_collections, 1);

    for (i, &obj) in roots[young_start..young_start + 4].iter().enumerate() {
        assert_eq!(unsafe { payload(obj, 16) }, i as u64);
    }
    for (i, &obj) in roots[young_start + 4..].iter().enumerate() {
        assert_eq!(unsafe { payload(obj, 16) }, 1000 + i as u64);
    }
    let kept = roots[last_big];
    assert_eq!(heap.space_of(kept.addr()), Some(Space::Nursery));
    assert_eq!(kept.addr(), heap.nursery.start(), "slid to the nursery base");
    assert_eq!(unsafe { m.read_element(holder, 0) }, kept);
    assert_eq!(heap.pending_remembered(), 1, "large-object slot still points into the nursery");
}

#[test]
fn large_object_space_full_runs_major() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots: Vec<ObjRef> = Vec::new();
    m.trigger_collection(GcCause::LargeObjectSpaceFull, &mut roots);
    let last = heap.last_cycle().unwrap();
    assert_eq!(last.kind, CollectionKind::Major);
    assert_eq!(last.cause, GcCause::LargeObjectSpaceFull);
}

// ── References and finalization ───────────────────────────────────────

#[test]
fn weak_referents_are_cleared_by_minor_and_major() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL; 3];
    let (weak, ty) = (reference(ReferenceKind::Weak), node());

    // an old reference to a young referent is found through the remembered set
    roots[0] = m.allocate_in(Space::Mature, weak, &mut roots).unwrap();
    let young = m.allocate(ty, &mut roots).unwrap();
    unsafe { m.write_ref(roots[0], REFERENT, young) };

    roots[1] = m.allocate(weak, &mut roots).unwrap();
    let young = m.allocate(ty, &mut roots).unwrap();
    unsafe { m.write_ref(roots[1], REFERENT, young) };

    // strongly reachable referent: roots[2] -> kept -> roots[2]
    roots[2] = m.allocate(ty, &mut roots).unwrap();
    unsafe { set_payload(roots[2], 32, 9) };
    let kept = m.allocate(weak, &mut roots).unwrap();
    unsafe {
        m.write_ref(kept, REFERENT, roots[2]);
        m.write_ref(roots[2], NEXT, kept);
    }

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);

    let last = heap.last_cycle().unwrap();
    assert_eq!(last.kind, CollectionKind::Minor);
    assert_eq!(last.cleared_references, 2);
    assert_eq!(unsafe { m.read_ref(roots[0], REFERENT) }, ObjRef::NULL);
    assert_eq!(unsafe { m.read_ref(roots[1], REFERENT) }, ObjRef::NULL);
    let kept = unsafe { m.read_ref(roots[2], NEXT) };
    assert_eq!(unsafe { m.read_ref(kept, REFERENT) }, roots[2], "repointed, not cleared");
    assert_eq!(heap.space_of(roots[2].addr()), Some(Space::Mature));

    // a mature referent survives minors and goes with the next major
    let old = m.allocate_in(Space::Mature, ty, &mut roots).unwrap();
    unsafe { m.write_ref(roots[0], REFERENT, old) };
    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
    assert_eq!(heap.last_cycle().unwrap().cleared_references, 0);
    assert_eq!(unsafe { m.read_ref(roots[0], REFERENT) }, old);

    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);

    let last = heap.last_cycle().unwrap();
    assert_eq!(last.kind, CollectionKind::Major);
    assert_eq!(last.cleared_references, 1);
    assert_eq!(unsafe { m.read_ref(roots[0], REFERENT) }, ObjRef::NULL);
    let kept = unsafe { m.read_ref(roots[2], NEXT) };
    assert_eq!(unsafe { m.read_ref(kept, REFERENT) }, roots[2]);
    assert_eq!(unsafe { payload(roots[2], 32) }, 9);
    assert_eq!(heap.stats().verification_failures, 0);
}

#[test]
fn soft_referents_survive_minors_only() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];

    roots[0] = m.allocate(reference(ReferenceKind::Soft), &mut roots).unwrap();
    let cached = m.allocate(node(), &mut roots).unwrap();
    unsafe {
        set_payload(cached, 32, 3);
        m.write_ref(roots[0], REFERENT, cached);
    }

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
    let cached = unsafe { m.read_ref(roots[0], REFERENT) };
    assert_eq!(heap.space_of(cached.addr()), Some(Space::Mature));
    assert_eq!(unsafe { payload(cached, 32) }, 3);

    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);
    assert_eq!(unsafe { m.read_ref(roots[0], REFERENT) }, ObjRef::NULL);
    assert_eq!(heap.last_cycle().unwrap().cleared_references, 1);
}

#[test]
fn unreachable_finalizable_object_is_queued_once() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL; 2];

    let res = m.allocate(resource(), &mut roots).unwrap();
    let child = m.allocate(node(), &mut roots).unwrap();
    unsafe {
        set_payload(res, 24, 77);
        set_payload(child, 32, 5);
        m.write_ref(res, 16, child);
    }
    roots[0] = m.allocate(reference(ReferenceKind::Phantom), &mut roots).unwrap();
    roots[1] = m.allocate(reference(ReferenceKind::Weak), &mut roots).unwrap();
    unsafe {
        m.write_ref(roots[0], REFERENT, res);
        m.write_ref(roots[1], REFERENT, res);
    }
    assert_eq!(heap.finalizers_registered(), 1);

    m.trigger_collection(GcCause::ExplicitRequest, &mut roots);

    let last = heap.last_cycle().unwrap();
    assert_eq!(last.finalizers_queued, 1);
    assert_eq!(last.cleared_references, 1, "weak cleared before finalization");
    assert_eq!(unsafe { m.read_ref(roots[1], REFERENT) }, ObjRef::NULL);
    assert_eq!(heap.finalizers_registered(), 0);
    assert_eq!(heap.finalizers_ready(), 1);
    let res = unsafe { m.read_ref(roots[0], REFERENT) };
    assert_eq!(heap.space_of(res.addr()), Some(Space::Mature), "kept alive and promoted");

    // queued objects stay alive until taken
    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);
    assert_eq!(heap.last_cycle().unwrap().finalizers_queued, 0);
    assert_eq!(heap.finalizers_ready(), 1);

    let taken = m.take_finalizable();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0], unsafe { m.read_ref(roots[0], REFERENT) });
    assert_eq!(unsafe { payload(taken[0], 24) }, 77);
    let child = unsafe { m.read_ref(taken[0], 16) };
    assert_eq!(unsafe { payload(child, 32) }, 5);
    assert_eq!(heap.finalizers_ready(), 0);

    // finalized and dropped: only now does the phantom referent go
    drop(taken);
    m.collect(GcRequest::major(GcCause::ExplicitRequest), &mut roots);
    let last = heap.last_cycle().unwrap();
    assert_eq!(last.cleared_references, 1);
    assert_eq!(last.finalizers_queued, 0);
    assert_eq!(unsafe { m.read_ref(roots[0], REFERENT) }, ObjRef::NULL);
    assert_eq!(heap.stats().verification_failures, 0);
}

// ── Liveness over many cycles ─────────────────────────────────────────

#[test]
fn chains_survive_mixed_cycles() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];
    let ty = node();

    for cycle in 0..8u64 {
        // extend the chain and leave garbage behind
        for i in 0..50 {
            let obj = m.allocate(ty, &mut roots).unwrap();
            unsafe {
                set_payload(obj, 32, cycle * 50 + i);
                m.write_ref(obj, NEXT, roots[0]);
            }
            roots[0] = obj;
            m.allocate(ty, &mut roots).unwrap();
        }

        let request = if cycle % 3 == 2 {
            GcRequest::major(GcCause::ExplicitRequest)
        } else {
            GcRequest::new(GcCause::ExplicitRequest)
        };
        m.collect(request, &mut roots);

        let len = (cycle + 1) * 50;
        let payloads = unsafe { chain_payloads(roots[0]) };
        assert_eq!(payloads, (0..len).rev().collect::<Vec<_>>(), "cycle {cycle}");
    }

    let stats = heap.stats();
    assert_eq!(stats.collections, 8);
    assert_eq!(stats.major, 2);
    assert_eq!(stats.verification_failures, 0);
}

#[test]
fn non_generational_minor_traces_mature_space() {
    init_logger();
    let settings = HeapSettings {
        generational: false,
        ..create_test_settings()
    };
    let heap = Heap::new(settings).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];
    let ty = node();

    roots[0] = m.allocate_in(Space::Mature, ty, &mut roots).unwrap();
    for cycle in 0..6u64 {
        // no barrier: the young object is only found by tracing mature space
        let young = m.allocate(ty, &mut roots).unwrap();
        unsafe {
            set_payload(young, 32, cycle);
            let prev = m.read_ref(roots[0], NEXT);
            m.write_ref(young, NEXT, prev);
            m.write_ref(roots[0], NEXT, young);
        }
        assert_eq!(heap.pending_remembered(), 0);

        m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
        assert_eq!(heap.last_cycle().unwrap().kind, CollectionKind::Minor);

        let first = unsafe { m.read_ref(roots[0], NEXT) };
        let payloads = unsafe { chain_payloads(first) };
        assert_eq!(payloads, (0..=cycle).rev().collect::<Vec<_>>(), "cycle {cycle}");
    }
    assert_eq!(heap.stats().verification_failures, 0);
}

// ── Multiple mutators ─────────────────────────────────────────────────

#[test]
fn rendezvous_repoints_every_threads_roots() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let threads = 4;
    let triggers = 5;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let heap = heap.clone();
            std::thread::spawn(move || {
                let mut m = heap.mutator();
                let mut roots = vec![ObjRef::NULL];
                let ty = node();
                let mut heads = Vec::new();

                for i in 0..400u64 {
                    let obj = m.allocate(ty, &mut roots).unwrap();
                    unsafe {
                        set_payload(obj, 32, t * 10_000 + i);
                        m.write_ref(obj, NEXT, roots[0]);
                    }
                    roots[0] = obj;
                    if t == 0 && i % 80 == 79 {
                        m.trigger_collection(GcCause::ExplicitRequest, &mut roots);
                        heads.push(roots[0]);
                    } else {
                        m.safepoint(&mut roots);
                    }
                }

                let payloads = unsafe { chain_payloads(roots[0]) };
                let expected: Vec<u64> = (0..400).rev().map(|i| t * 10_000 + i).collect();
                assert_eq!(payloads, expected, "thread {t}");
                heads.len()
            })
        })
        .collect();

    let triggered: usize = handles
        .into_iter()
        .map(|h| h.join().expect("mutator thread panicked"))
        .sum();

    assert_eq!(triggered, triggers);
    let stats = heap.stats();
    assert!(stats.collections >= triggers, "{stats:?}");
    assert_eq!(stats.verification_failures, 0);
    assert_eq!(heap.num_mutators(), 0);
}

// ── Startup and verification ──────────────────────────────────────────

#[test]
fn degraded_reservation_still_partitions() {
    init_logger();
    let settings = create_test_settings();
    let limit = 3 * 1024 * 1024;
    let (base, size) = reserve_degrading(8 * 1024 * 1024, 1024 * 1024, 1024 * 1024, |s| {
        if s <= limit { reserve_memory(s) } else { None }
    })
    .unwrap();
    assert_eq!(size, limit);

    let p = Partition::new(&settings, size).unwrap();
    assert_eq!(p.nursery + p.mature + p.large_object, size);
    unmap_memory(base, size);
}

#[test]
fn reservation_below_minimum_fails() {
    let err = reserve_degrading(4 * 1024 * 1024, 2 * 1024 * 1024, 1024 * 1024, |_| None)
        .unwrap_err();
    assert_eq!(
        err,
        HeapError::ReservationFailed {
            requested: 4 * 1024 * 1024,
            minimum: 2 * 1024 * 1024,
        }
    );
}

#[test]
fn verification_reports_forged_forwarding() {
    init_logger();
    let heap = Heap::new(create_test_settings()).unwrap();
    let mut m = heap.mutator();
    let mut roots = vec![ObjRef::NULL];

    roots[0] = m.allocate(node(), &mut roots).unwrap();
    let report = m.verify(&mut roots);
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(report.live_objects, 1);

    let header = unsafe { roots[0].header() };
    let info = header.info_raw();
    header.set_forwarding(ObjRef::from_addr(heap.mature.start()));
    let report = m.verify(&mut roots);
    assert!(!report.is_ok());
    assert!(report.errors[0].contains("forwarded outside a collection"));

    // restore the header before anything else looks at it
    header.clear_gc_bits();
    header.set_info(info & !0b11);
    assert!(m.verify(&mut roots).is_ok());

    let mut stray = vec![ObjRef::from_addr(0x1000)];
    let report = m.verify(&mut stray);
    assert!(report.errors[0].contains("outside the heap"));
}
