//! Page-aligned byte buffers.
//!
//! Direct I/O requires the user buffer, the file offset and the transfer
//! length to all be aligned; ring slots and write staging buffers are
//! therefore allocated on page boundaries.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::OnceLock;

/// System page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        // SAFETY: sysconf has no memory preconditions.
        #[allow(unsafe_code)]
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// A heap allocation aligned to the system page size.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Allocates `len` zeroed bytes on a page boundary.
    ///
    /// # Panics
    /// Panics if `len` is zero or overflows an allocation request.
    #[allow(unsafe_code)]
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-length aligned allocation");
        let Ok(layout) = Layout::from_size_align(len, page_size()) else {
            panic!("invalid aligned allocation of {len} bytes");
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        AlignedBuf { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    #[allow(unsafe_code)]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is a live allocation of len bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    #[allow(unsafe_code)]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is a live allocation of len bytes, held exclusively.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        let Ok(layout) = Layout::from_size_align(self.len, page_size()) else {
            return;
        };
        // SAFETY: allocated in zeroed() with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

// SAFETY: the buffer is plain bytes with exclusive mutation through &mut.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuf {}
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuf {}
