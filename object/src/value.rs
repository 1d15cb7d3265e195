use crate::Header;

/// Required alignment of every heap object. Object sizes are rounded up to
/// this, which keeps the low header bits free for GC state.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Rounds `size` up to [`OBJECT_ALIGNMENT`].
#[inline(always)]
pub const fn align_object_size(size: usize) -> usize {
    (size + (OBJECT_ALIGNMENT - 1)) & !(OBJECT_ALIGNMENT - 1)
}

/// An untagged reference to a heap object.
///
/// Encoding:
/// - **Null**:      all zero bits.
/// - **Reference**: address of the object's [`Header`], 8-byte aligned.
///
/// Reference fields of heap objects hold exactly this word, so the collector
/// can read and rewrite them in place.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct ObjRef(usize);

impl ObjRef {
    pub const NULL: Self = Self(0);

    #[inline(always)]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        let addr = ptr as usize;
        debug_assert!(
            addr & (OBJECT_ALIGNMENT - 1) == 0,
            "object pointer not aligned: 0x{addr:x}"
        );
        Self(addr)
    }

    #[inline(always)]
    pub const fn addr(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// # Safety
    ///
    /// The reference must be non-null and point to an initialized object.
    #[inline(always)]
    pub unsafe fn header<'a>(self) -> &'a Header {
        debug_assert!(!self.is_null(), "dereferencing null object");
        // SAFETY: caller guarantees a live object at this address
        unsafe { &*(self.0 as *const Header) }
    }

    /// Address `offset` bytes into the object, viewed as a reference slot.
    #[inline(always)]
    pub fn slot(self, offset: usize) -> *mut ObjRef {
        (self.0 + offset) as *mut ObjRef
    }
}

impl core::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "Null")
        } else {
            write!(f, "Ref(0x{:x})", self.0)
        }
    }
}
