mod barrier;
mod bitmap;
mod block;
mod collector;
mod error;
pub mod fixup;
mod forwarding;
mod heap;
mod los;
mod major;
mod minor;
mod mutator;
mod references;
pub mod remset;
mod roots;
mod scheduler;
mod settings;
mod space;
mod state;
mod stats;
mod system;
mod verify;

pub use barrier::{PauseBarrier, Phase};
pub use bitmap::MarkBitmap;
pub use block::{BlockSpace, Tlab};
pub use collector::{Collector, WorkPool, run_parallel};
pub use error::{HeapError, HeapResult};
pub use fixup::{FixupPlan, FixupTask, SlotFixer, object_fix_ref_slots, slot_fix};
pub use forwarding::{Forwarding, HeaderForwarding, TableForwarding};
pub use heap::{Heap, HeapInner, Partition, SyncState};
pub use los::{FreeAreaPool, LargeObjectSpace, SweepResult};
pub use major::MajorOutcome;
pub use minor::MinorOutcome;
pub use mutator::{Mutator, MutatorRecord};
pub use references::{FinalizerQueue, ReferenceOutcome};
pub use remset::{RemsetRing, merge_buffers};
pub use roots::{RootProvider, RootSet, RootSlot, RootSubmission};
pub use scheduler::{CollectionKind, GcCause, adapt_nursery_blocks, decide_collection_kind};
pub use settings::HeapSettings;
pub use space::{Space, SpaceStats};
pub use state::{GcRequest, GcState};
pub use stats::{CycleStats, HeapStats};
pub use system::{
    OS_PAGE_SIZE, commit_memory, decommit_memory, reserve_degrading, reserve_memory,
    unmap_memory,
};
pub use verify::{VerifyReport, verify_heap};
