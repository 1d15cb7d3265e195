//! Where the new address of a relocated object is found.
//!
//! Copying cycles keep it in the old object's header: the info word holds
//! the destination with both flip bits set. Compacting cycles need the
//! header bits for marking and overwrite old locations while sliding, so
//! they keep it in a side table keyed by old address. The fixup pass is
//! generic over the two.

use object::ObjRef;
use rustc_hash::FxHashMap;

pub trait Forwarding: Sync {
    /// Whether `obj` was relocated during the running cycle.
    ///
    /// # Safety
    ///
    /// `obj` must be a non-null reference read from a live slot.
    unsafe fn is_moved(&self, obj: ObjRef) -> bool;

    /// New address of a relocated object.
    ///
    /// # Safety
    ///
    /// `obj` must satisfy [`Forwarding::is_moved`].
    unsafe fn forwarding(&self, obj: ObjRef) -> ObjRef;

    /// `Some(new address)` if `obj` moved. Checks [`Forwarding::is_moved`]
    /// before trusting any forwarding state.
    ///
    /// # Safety
    ///
    /// Same as [`Forwarding::is_moved`].
    #[inline(always)]
    unsafe fn resolve(&self, obj: ObjRef) -> Option<ObjRef> {
        // SAFETY: forwarded from caller
        unsafe { self.is_moved(obj).then(|| self.forwarding(obj)) }
    }
}

/// Forwarding pointers stored in object headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderForwarding;

impl Forwarding for HeaderForwarding {
    #[inline(always)]
    unsafe fn is_moved(&self, obj: ObjRef) -> bool {
        // SAFETY: caller guarantees a live object; the vtable and info
        // words of a copied-from object stay readable until the cycle ends
        unsafe { obj.header() }.is_moved()
    }

    #[inline(always)]
    unsafe fn forwarding(&self, obj: ObjRef) -> ObjRef {
        // SAFETY: caller guarantees obj is moved
        unsafe { obj.header() }.forwarding()
    }
}

/// Forwarding pointers kept in a side table.
#[derive(Debug, Default)]
pub struct TableForwarding {
    table: FxHashMap<usize, usize>,
}

impl TableForwarding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: ObjRef, to: ObjRef) {
        debug_assert_ne!(from, to, "identity forwarding");
        let prev = self.table.insert(from.addr(), to.addr());
        debug_assert!(prev.is_none(), "object {from:?} forwarded twice");
    }

    pub fn get(&self, from: ObjRef) -> Option<ObjRef> {
        self.table.get(&from.addr()).map(|&to| ObjRef::from_addr(to))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Forwarding for TableForwarding {
    #[inline(always)]
    unsafe fn is_moved(&self, obj: ObjRef) -> bool {
        self.table.contains_key(&obj.addr())
    }

    #[inline(always)]
    unsafe fn forwarding(&self, obj: ObjRef) -> ObjRef {
        match self.get(obj) {
            Some(to) => to,
            None => panic!("illegal forwarding lookup for {obj:?}"),
        }
    }

    #[inline(always)]
    unsafe fn resolve(&self, obj: ObjRef) -> Option<ObjRef> {
        self.get(obj)
    }
}
