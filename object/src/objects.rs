use crate::header::Header;
use crate::{ObjRef, TypeInfo};

// ── Array ──────────────────────────────────────────────────────────

/// Fixed prefix of every array object.
///
/// ```text
/// [Header 16B] [length: u32] [pad: u32] [elements ...]
/// ```
///
/// The first element lives at the type's `first_elem_offset`, which is at
/// least [`ArrayHeader::SIZE`].
#[repr(C)]
pub struct ArrayHeader {
    pub header: Header,
    length: u32,
    _pad: u32,
}

const _: () = assert!(size_of::<ArrayHeader>() == 24);

impl ArrayHeader {
    pub const SIZE: usize = size_of::<ArrayHeader>();
    pub const LENGTH_OFFSET: usize = Header::SIZE;

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// # Safety
    ///
    /// `obj` must be an initialized array object.
    #[inline(always)]
    pub unsafe fn length_of(obj: ObjRef) -> usize {
        // SAFETY: caller guarantees an array header at obj
        unsafe { (*(obj.addr() as *const ArrayHeader)).len() }
    }
}

// ── Initialization ─────────────────────────────────────────────────

/// Writes a fresh header for `ty` at `ptr` and zeroes the remaining `size`
/// bytes, so every reference field starts out null.
///
/// # Safety
///
/// `ptr` must be valid for `size` bytes and aligned to 8.
pub unsafe fn init_object(
    ptr: *mut u8,
    ty: &'static TypeInfo,
    size: usize,
) -> ObjRef {
    debug_assert!(size >= Header::SIZE);
    // SAFETY: caller guarantees `size` writable bytes at ptr
    unsafe {
        ptr.add(Header::SIZE).write_bytes(0, size - Header::SIZE);
        (ptr as *mut Header).write(Header::new(ty));
    }
    ObjRef::from_ptr(ptr)
}

/// Like [`init_object`], for an array of `len` elements.
///
/// # Safety
///
/// `ptr` must be valid for `ty.array_size(len)` bytes and aligned to 8.
pub unsafe fn init_array(
    ptr: *mut u8,
    ty: &'static TypeInfo,
    len: usize,
) -> ObjRef {
    debug_assert!(ty.is_array());
    debug_assert!(len <= u32::MAX as usize, "array too long");
    let size = ty.array_size(len);
    // SAFETY: caller guarantees `size` writable bytes at ptr
    unsafe {
        ptr.add(Header::SIZE).write_bytes(0, size - Header::SIZE);
        ptr.cast::<Header>().write(Header::new(ty));
        let array = ptr as *mut ArrayHeader;
        (*array).length = len as u32;
    }
    ObjRef::from_ptr(ptr)
}

// ── Reference slots ────────────────────────────────────────────────

/// Addresses of every reference-bearing slot of one object.
///
/// Reference arrays yield every element unconditionally; other objects
/// yield the offsets listed in their type, in ascending order.
#[derive(Debug)]
pub enum RefSlots {
    Empty,
    Array { cur: usize, end: usize },
    Fields {
        base: usize,
        offsets: std::slice::Iter<'static, u32>,
    },
}

impl Iterator for RefSlots {
    type Item = *mut ObjRef;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RefSlots::Empty => None,
            RefSlots::Array { cur, end } => {
                if *cur >= *end {
                    return None;
                }
                let slot = *cur as *mut ObjRef;
                *cur += size_of::<ObjRef>();
                Some(slot)
            }
            RefSlots::Fields { base, offsets } => offsets
                .next()
                .map(|&off| (*base + off as usize) as *mut ObjRef),
        }
    }
}

/// Enumerates the reference slots of `obj` from its metadata.
///
/// # Safety
///
/// `obj` must be an initialized object whose vtable word is intact (a
/// forwarded object still qualifies; forwarding lives in the info word).
#[inline]
pub unsafe fn ref_slots(obj: ObjRef) -> RefSlots {
    // SAFETY: caller guarantees an initialized header
    let ty = unsafe { obj.header() }.type_info();
    if !ty.has_refs() {
        return RefSlots::Empty;
    }
    if ty.is_array() {
        // SAFETY: the type says this is an array
        let len = unsafe { ArrayHeader::length_of(obj) };
        let cur = obj.addr() + ty.first_elem_offset();
        RefSlots::Array {
            cur,
            end: cur + len * size_of::<ObjRef>(),
        }
    } else {
        let offsets: &'static [u32] = ty.ref_offsets();
        RefSlots::Fields {
            base: obj.addr(),
            offsets: offsets.iter(),
        }
    }
}

/// The referent field of a weak, soft, or phantom reference object.
/// Tracing never follows it; see [`crate::ReferenceKind`].
///
/// # Safety
///
/// `obj` must be an initialized object whose vtable word is intact.
#[inline]
pub unsafe fn referent_slot(obj: ObjRef) -> Option<*mut ObjRef> {
    // SAFETY: caller guarantees an initialized header
    let ty = unsafe { obj.header() }.type_info();
    ty.referent_offset().map(|off| obj.slot(off))
}

/// Size of `obj` in bytes, from its metadata.
///
/// # Safety
///
/// `obj` must be an initialized object.
#[inline]
pub unsafe fn object_size(obj: ObjRef) -> usize {
    // SAFETY: caller guarantees an initialized header
    unsafe { obj.header().type_info().size_of(obj) }
}
