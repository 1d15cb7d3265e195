//! A synthetic multi-threaded workload for the generational heap.
//!
//! Every thread grows a linked list of small nodes, drops garbage between
//! them, and now and then hangs a large byte array off the newest node.
//! One thread requests collections at fixed intervals. At the end each
//! thread walks its list and checks that nothing was lost or reordered.

use std::thread;
use std::time::{Duration, Instant};

use heap::{GcCause, GcRequest, Heap, HeapError, Mutator};
use object::{ObjRef, TypeBuilder, TypeError, TypeInfo};
use thiserror::Error;

pub const NEXT: usize = 16;
pub const OTHER: usize = 24;
pub const PAYLOAD: usize = 32;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("bad object layout: {0}")]
    Type(#[from] TypeError),

    #[error("thread {thread}: node {index} holds {found}, expected {expected}")]
    Corrupted {
        thread: usize,
        index: usize,
        expected: u64,
        found: u64,
    },

    #[error("thread {thread}: list has {found} nodes, expected {expected}")]
    Length {
        thread: usize,
        expected: usize,
        found: usize,
    },
}

/// The object shapes the workload allocates.
#[derive(Debug, Clone, Copy)]
pub struct Types {
    /// `next`, `other`, one payload word.
    pub node: &'static TypeInfo,
    pub bytes: &'static TypeInfo,
}

impl Types {
    pub fn new() -> Result<Self, TypeError> {
        Ok(Self {
            node: TypeBuilder::object("Node").fields(2, 1).leak()?,
            bytes: TypeBuilder::array("byte[]", 1, false).leak()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Workload {
    pub threads: usize,
    /// Live nodes per thread.
    pub objects: usize,
    /// Unreachable nodes allocated after each live one.
    pub garbage: usize,
    /// Hang a large array off every n-th node; 0 disables.
    pub large_every: usize,
    /// Byte length of each large array.
    pub large_len: usize,
    /// Explicit collections requested by thread 0.
    pub collections: usize,
    /// Every n-th explicit collection is forced to be major; 0 disables.
    pub major_every: usize,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            threads: 4,
            objects: 10_000,
            garbage: 4,
            large_every: 500,
            large_len: 16 * 1024,
            collections: 8,
            major_every: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadReport {
    pub thread: usize,
    pub live_nodes: usize,
    pub large_objects: usize,
    pub allocated: usize,
    pub requested: usize,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub threads: Vec<ThreadReport>,
    pub elapsed: Duration,
}

impl Report {
    pub fn allocated(&self) -> usize {
        self.threads.iter().map(|t| t.allocated).sum()
    }
}

/// Runs `workload` on `heap` and checks every thread's list afterwards.
pub fn run(heap: &Heap, workload: &Workload) -> Result<Report, WorkloadError> {
    let types = Types::new()?;
    let start = Instant::now();

    let results: Vec<Result<ThreadReport, WorkloadError>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workload.threads)
            .map(|t| s.spawn(move || run_thread(heap, workload, types, t)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    });

    let threads = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    Ok(Report {
        threads,
        elapsed: start.elapsed(),
    })
}

fn run_thread(
    heap: &Heap,
    workload: &Workload,
    types: Types,
    thread: usize,
) -> Result<ThreadReport, WorkloadError> {
    let mut m = heap.mutator();
    log::debug!("workload thread {thread} runs as mutator {}", m.id());

    // [list head, scratch]
    let mut roots = vec![ObjRef::NULL; 2];
    let interval = workload.objects / (workload.collections + 1);
    let mut requested = 0;
    let mut large_objects = 0;

    for i in 0..workload.objects {
        roots[1] = m.allocate(types.node, &mut roots)?;
        // SAFETY: both are live nodes, rooted across the allocations below
        unsafe {
            *((roots[1].addr() + PAYLOAD) as *mut u64) = i as u64;
            m.write_ref(roots[1], NEXT, roots[0]);
        }
        roots[0] = roots[1];

        for _ in 0..workload.garbage {
            m.allocate(types.node, &mut roots)?;
        }

        if workload.large_every > 0 && i % workload.large_every == 0 {
            let large = m.allocate_array(types.bytes, workload.large_len, &mut roots)?;
            // SAFETY: the head is a live node
            unsafe { m.write_ref(roots[0], OTHER, large) };
            large_objects += 1;
        }

        if thread == 0 && interval > 0 && (i + 1) % interval == 0 && requested < workload.collections
        {
            requested += 1;
            let request = if workload.major_every > 0 && requested % workload.major_every == 0 {
                GcRequest::major(GcCause::ExplicitRequest)
            } else {
                GcRequest::new(GcCause::ExplicitRequest)
            };
            m.collect(request, &mut roots);
        } else {
            m.safepoint(&mut roots);
        }
    }

    let (live_nodes, reachable_large) = check_list(&m, roots[0], workload.objects, thread)?;
    debug_assert_eq!(reachable_large, large_objects);
    Ok(ThreadReport {
        thread,
        live_nodes,
        large_objects: reachable_large,
        allocated: m.allocated(),
        requested,
    })
}

/// Walks the list from `head`, expecting payloads `len - 1` down to 0.
/// Returns the node count and the number of attached large arrays.
fn check_list(
    m: &Mutator,
    head: ObjRef,
    len: usize,
    thread: usize,
) -> Result<(usize, usize), WorkloadError> {
    let mut cur = head;
    let mut index = 0;
    let mut large = 0;
    while !cur.is_null() {
        if index == len {
            return Err(WorkloadError::Length {
                thread,
                expected: len,
                found: index + 1,
            });
        }
        let expected = (len - 1 - index) as u64;
        // SAFETY: every node on the list is live
        let found = unsafe { payload(cur) };
        if found != expected {
            return Err(WorkloadError::Corrupted {
                thread,
                index,
                expected,
                found,
            });
        }
        // SAFETY: see above
        unsafe {
            if !m.read_ref(cur, OTHER).is_null() {
                large += 1;
            }
            cur = m.read_ref(cur, NEXT);
        }
        index += 1;
    }
    if index != len {
        return Err(WorkloadError::Length {
            thread,
            expected: len,
            found: index,
        });
    }
    Ok((index, large))
}

/// # Safety
///
/// `node` must be a live node.
unsafe fn payload(node: ObjRef) -> u64 {
    // SAFETY: forwarded from caller
    unsafe { *((node.addr() + PAYLOAD) as *const u64) }
}
