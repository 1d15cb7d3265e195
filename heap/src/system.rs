use std::ptr::NonNull;

use crate::{HeapError, HeapResult};

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MAP_NORESERVE: i32 = 0x4000;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_NORESERVE: i32 = 0x40;

    pub const MADV_DONTNEED: i32 = 4;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap, mprotect and madvise
    /// # Safety
    /// see valid usage of the posix calls online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    }

    /// reserves address space without backing it
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_reserve(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_NONE,
                MAP_PRIVATE | MAP_ANON | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;

/// Reserves `size` bytes of address space. Nothing is readable until
/// [`commit_memory`] is called on a range of it.
#[must_use]
pub fn reserve_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_reserve(size) };
    NonNull::new(ptr)
}

/// Makes a page-aligned range of a reservation readable and writable.
/// Fresh pages read as zero.
pub fn commit_memory(ptr: NonNull<u8>, size: usize) -> bool {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: ptr must be inside a reservation made by reserve_memory
    let rc = unsafe {
        unix::mprotect(
            ptr.as_ptr().cast(),
            size,
            unix::PROT_READ | unix::PROT_WRITE,
        )
    };
    rc == 0
}

/// Returns the physical pages of a committed range to the OS and makes the
/// range inaccessible again.
pub fn decommit_memory(ptr: NonNull<u8>, size: usize) {
    debug_assert!((ptr.as_ptr() as usize).is_multiple_of(OS_PAGE_SIZE));
    // SAFETY: ptr must be inside a reservation made by reserve_memory
    unsafe {
        let _ = unix::madvise(ptr.as_ptr().cast(), size, unix::MADV_DONTNEED);
        let _ = unix::mprotect(ptr.as_ptr().cast(), size, unix::PROT_NONE);
    }
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Reserves as much of `requested` as the OS allows, shrinking by `step`
/// after each rejection. Falling below `minimum` is fatal for startup.
pub fn reserve_degrading(
    requested: usize,
    minimum: usize,
    step: usize,
    mut reserve: impl FnMut(usize) -> Option<NonNull<u8>>,
) -> HeapResult<(NonNull<u8>, usize)> {
    debug_assert!(step > 0);
    let mut size = requested;
    while size >= minimum && size > 0 {
        if let Some(ptr) = reserve(size) {
            if size != requested {
                log::warn!(
                    "heap reservation degraded from {requested} to {size} bytes"
                );
            }
            return Ok((ptr, size));
        }
        log::trace!("reservation of {size} bytes rejected");
        size = size.saturating_sub(step);
    }
    Err(HeapError::ReservationFailed { requested, minimum })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_decommit() {
        let size = 16 * OS_PAGE_SIZE;
        let base = reserve_memory(size).expect("reserve");
        assert!(commit_memory(base, 2 * OS_PAGE_SIZE));

        unsafe {
            assert_eq!(*base.as_ptr(), 0);
            base.as_ptr().write(42);
            assert_eq!(*base.as_ptr(), 42);
        }

        decommit_memory(base, 2 * OS_PAGE_SIZE);
        assert!(commit_memory(base, OS_PAGE_SIZE));
        assert_eq!(unsafe { *base.as_ptr() }, 0, "decommitted pages read zero");
        unmap_memory(base, size);
    }

    #[test]
    fn degrading_reservation_shrinks_until_accepted() {
        let mut attempts = Vec::new();
        let fake = NonNull::<u8>::dangling();
        let (_, size) = reserve_degrading(10 * OS_PAGE_SIZE, OS_PAGE_SIZE, OS_PAGE_SIZE, |s| {
            attempts.push(s);
            (s <= 7 * OS_PAGE_SIZE).then_some(fake)
        })
        .unwrap();

        assert_eq!(size, 7 * OS_PAGE_SIZE);
        assert_eq!(attempts.len(), 4);
    }

    #[test]
    fn degrading_reservation_respects_minimum() {
        let err = reserve_degrading(8 * OS_PAGE_SIZE, 6 * OS_PAGE_SIZE, OS_PAGE_SIZE, |_| None)
            .unwrap_err();
        assert!(matches!(
            err,
            HeapError::ReservationFailed { requested, minimum }
                if requested == 8 * OS_PAGE_SIZE && minimum == 6 * OS_PAGE_SIZE
        ));
    }
}
