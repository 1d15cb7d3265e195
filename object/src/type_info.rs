use crate::{ArrayHeader, Header, ObjRef, align_object_size};

/// Class property flags copied from the execution engine's class layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct TypeFlags(pub u8);

impl TypeFlags {
    pub const NONE: Self = Self(0);
    pub const FINALIZER: Self = Self(1 << 0);
    pub const ARRAY: Self = Self(1 << 1);
    pub const REFS: Self = Self(1 << 2);
    pub const REF_ARRAY: Self = Self(Self::ARRAY.0 | Self::REFS.0);

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }
}

/// Special reference semantics of a class (java.lang.ref style).
///
/// Instances of a non-strong class carry one referent field that tracing
/// does not follow. The collector clears it once the referent is no longer
/// strongly reachable: weak referents before finalizers are queued,
/// phantom referents after, soft referents only in major cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReferenceKind {
    #[default]
    Strong = 0,
    Weak = 1,
    Soft = 2,
    Phantom = 3,
}

impl ReferenceKind {
    /// Two-bit code, used to tag remembered referent slots.
    #[inline(always)]
    pub const fn code(self) -> usize {
        self as usize
    }

    #[inline(always)]
    pub const fn from_code(code: usize) -> Self {
        match code & 0b11 {
            1 => ReferenceKind::Weak,
            2 => ReferenceKind::Soft,
            3 => ReferenceKind::Phantom,
            _ => ReferenceKind::Strong,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeError {
    /// Instance size smaller than the object header.
    InstanceTooSmall,
    /// A reference offset overlaps the header or runs past the instance.
    OffsetOutOfBounds(u32),
    /// A reference offset is not word aligned.
    MisalignedOffset(u32),
    /// Element size is zero or the first element overlaps the array header.
    BadArrayLayout,
    /// Arrays cannot be weak, soft, or phantom references.
    ArrayReferent,
}

impl std::fmt::Display for TypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeError::InstanceTooSmall => {
                write!(f, "instance size must cover the object header")
            }
            TypeError::OffsetOutOfBounds(off) => {
                write!(f, "reference offset {off} outside instance fields")
            }
            TypeError::MisalignedOffset(off) => {
                write!(f, "reference offset {off} is not word aligned")
            }
            TypeError::BadArrayLayout => write!(f, "invalid array element layout"),
            TypeError::ArrayReferent => write!(f, "array types cannot carry a referent"),
        }
    }
}

impl std::error::Error for TypeError {}

/// Per-class metadata the collector uses to interpret raw object memory.
///
/// The offsets must match how the execution engine lays out fields; the
/// collector performs no other introspection. Instances are immutable and
/// live for the rest of the process (see [`TypeBuilder::leak`]), because
/// every header points at one.
#[derive(Debug)]
#[repr(align(8))]
pub struct TypeInfo {
    name: &'static str,
    flags: TypeFlags,
    reference_kind: ReferenceKind,
    /// Zero for strong classes.
    referent_offset: u32,
    instance_size: u32,
    elem_size: u32,
    first_elem_offset: u32,
    ref_offsets: Box<[u32]>,
}

impl TypeInfo {
    #[inline(always)]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline(always)]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    #[inline(always)]
    pub fn is_array(&self) -> bool {
        self.flags.contains(TypeFlags::ARRAY)
    }

    #[inline(always)]
    pub fn has_refs(&self) -> bool {
        self.flags.contains(TypeFlags::REFS)
    }

    #[inline(always)]
    pub fn is_ref_array(&self) -> bool {
        self.flags.contains(TypeFlags::REF_ARRAY)
    }

    #[inline(always)]
    pub fn is_primitive_array(&self) -> bool {
        self.is_array() && !self.has_refs()
    }

    #[inline(always)]
    pub fn has_finalizer(&self) -> bool {
        self.flags.contains(TypeFlags::FINALIZER)
    }

    #[inline(always)]
    pub fn reference_kind(&self) -> ReferenceKind {
        self.reference_kind
    }

    #[inline(always)]
    pub fn is_reference(&self) -> bool {
        self.reference_kind != ReferenceKind::Strong
    }

    /// Offset of the referent field. Not part of [`TypeInfo::ref_offsets`].
    #[inline(always)]
    pub fn referent_offset(&self) -> Option<usize> {
        (self.referent_offset != 0).then_some(self.referent_offset as usize)
    }

    /// Offsets of the reference fields of a non-array instance.
    #[inline(always)]
    pub fn ref_offsets(&self) -> &[u32] {
        &self.ref_offsets
    }

    #[inline(always)]
    pub fn instance_size(&self) -> usize {
        self.instance_size as usize
    }

    #[inline(always)]
    pub fn elem_size(&self) -> usize {
        self.elem_size as usize
    }

    #[inline(always)]
    pub fn first_elem_offset(&self) -> usize {
        self.first_elem_offset as usize
    }

    /// Allocation size of an array of this type with `len` elements.
    #[inline(always)]
    pub fn array_size(&self, len: usize) -> usize {
        debug_assert!(self.is_array());
        align_object_size(self.first_elem_offset() + self.elem_size() * len)
    }

    /// Allocation size of an instance; `len` is ignored for non-arrays.
    #[inline(always)]
    pub fn allocation_size(&self, len: usize) -> usize {
        if self.is_array() {
            self.array_size(len)
        } else {
            self.instance_size()
        }
    }

    /// Size of the object at `obj`, computed from metadata and, for arrays,
    /// the stored length.
    ///
    /// # Safety
    ///
    /// `obj` must be an initialized object of this type.
    #[inline(always)]
    pub unsafe fn size_of(&self, obj: ObjRef) -> usize {
        if self.is_array() {
            // SAFETY: arrays start with an ArrayHeader
            let len = unsafe { ArrayHeader::length_of(obj) };
            self.array_size(len)
        } else {
            self.instance_size()
        }
    }
}

/// Builds and validates a [`TypeInfo`].
#[derive(Debug)]
pub struct TypeBuilder {
    name: &'static str,
    flags: TypeFlags,
    reference_kind: ReferenceKind,
    referent_offset: u32,
    instance_size: u32,
    elem_size: u32,
    first_elem_offset: u32,
    ref_offsets: Vec<u32>,
}

impl TypeBuilder {
    /// A plain (non-array) class with no fields beyond the header.
    pub fn object(name: &'static str) -> Self {
        Self {
            name,
            flags: TypeFlags::NONE,
            reference_kind: ReferenceKind::Strong,
            referent_offset: 0,
            instance_size: Header::SIZE as u32,
            elem_size: 0,
            first_elem_offset: 0,
            ref_offsets: Vec::new(),
        }
    }

    /// An array class. Reference arrays have word-sized elements.
    pub fn array(name: &'static str, elem_size: u32, refs: bool) -> Self {
        let mut flags = TypeFlags::ARRAY;
        if refs {
            flags = flags.with(TypeFlags::REFS);
        }
        Self {
            name,
            flags,
            reference_kind: ReferenceKind::Strong,
            referent_offset: 0,
            instance_size: 0,
            elem_size: if refs { size_of::<ObjRef>() as u32 } else { elem_size },
            first_elem_offset: ArrayHeader::SIZE as u32,
            ref_offsets: Vec::new(),
        }
    }

    pub fn instance_size(mut self, size: u32) -> Self {
        self.instance_size = size;
        self
    }

    pub fn ref_field(mut self, offset: u32) -> Self {
        self.ref_offsets.push(offset);
        self
    }

    /// Appends `refs` reference fields and then `scalars` word-sized
    /// non-reference fields after the current end of the instance.
    pub fn fields(mut self, refs: u32, scalars: u32) -> Self {
        let word = size_of::<usize>() as u32;
        for _ in 0..refs {
            self.ref_offsets.push(self.instance_size);
            self.instance_size += word;
        }
        self.instance_size += scalars * word;
        self
    }

    pub fn first_elem_offset(mut self, offset: u32) -> Self {
        self.first_elem_offset = offset;
        self
    }

    pub fn finalizer(mut self) -> Self {
        self.flags = self.flags.with(TypeFlags::FINALIZER);
        self
    }

    /// Makes this a `kind` reference class and appends its referent field
    /// after the current end of the instance.
    pub fn referent(mut self, kind: ReferenceKind) -> Self {
        self.reference_kind = kind;
        if kind == ReferenceKind::Strong {
            self.referent_offset = 0;
        } else {
            self.referent_offset = self.instance_size;
            self.instance_size += size_of::<usize>() as u32;
        }
        self
    }

    pub fn build(mut self) -> Result<TypeInfo, TypeError> {
        let word = size_of::<usize>() as u32;
        if self.flags.contains(TypeFlags::ARRAY) {
            if self.reference_kind != ReferenceKind::Strong {
                return Err(TypeError::ArrayReferent);
            }
            if self.elem_size == 0
                || (self.first_elem_offset as usize) < ArrayHeader::SIZE
            {
                return Err(TypeError::BadArrayLayout);
            }
            if self.flags.contains(TypeFlags::REFS)
                && self.first_elem_offset % word != 0
            {
                return Err(TypeError::MisalignedOffset(self.first_elem_offset));
            }
            self.ref_offsets.clear();
        } else {
            if (self.instance_size as usize) < Header::SIZE {
                return Err(TypeError::InstanceTooSmall);
            }
            for &off in &self.ref_offsets {
                if (off as usize) < Header::SIZE || off + word > self.instance_size {
                    return Err(TypeError::OffsetOutOfBounds(off));
                }
                if off % word != 0 {
                    return Err(TypeError::MisalignedOffset(off));
                }
            }
            self.ref_offsets.sort_unstable();
            self.ref_offsets.dedup();
            if self.referent_offset != 0 && self.ref_offsets.contains(&self.referent_offset) {
                return Err(TypeError::OffsetOutOfBounds(self.referent_offset));
            }
            if !self.ref_offsets.is_empty() {
                self.flags = self.flags.with(TypeFlags::REFS);
            }
            self.instance_size = align_object_size(self.instance_size as usize) as u32;
        }

        Ok(TypeInfo {
            name: self.name,
            flags: self.flags,
            reference_kind: self.reference_kind,
            referent_offset: self.referent_offset,
            instance_size: self.instance_size,
            elem_size: self.elem_size,
            first_elem_offset: self.first_elem_offset,
            ref_offsets: self.ref_offsets.into_boxed_slice(),
        })
    }

    /// Builds the type and gives it a process lifetime, as headers require.
    pub fn leak(self) -> Result<&'static TypeInfo, TypeError> {
        Ok(Box::leak(Box::new(self.build()?)))
    }
}
