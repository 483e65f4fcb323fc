use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Fallback when the platform page size cannot be queried.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Platform page size; buffers are aligned to it so they can be mapped
/// individually by offset.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    DEFAULT_PAGE_SIZE
}

/// Align a value up to the given alignment (power of two).
#[inline]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// One contiguous anonymous mapping backing every buffer in a pool.
///
/// Buffers are carved out at `index * stride`, `stride` being the per-buffer
/// length rounded up to the page size. The arena owns the memory; buffer
/// regions are `(offset, len)` views that stay valid as long as the arena
/// lives. All region copies go through the owning buffer's lock, so no two
/// contexts ever touch the same region concurrently.
pub struct Arena {
    base: *mut u8,
    len: usize,
    stride: usize,
    _map: MmapMut,
}

// The base pointer is only dereferenced through `copy_into`/`copy_out`, whose
// callers hold the owning buffer's mutex for the affected region.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `count * stride` bytes of anonymous, page-aligned memory.
    pub fn with_capacity(count: usize, stride: usize) -> Result<Self> {
        let len = count
            .checked_mul(stride)
            .ok_or(Error::InvalidArgument("arena size overflow"))?;
        if len == 0 {
            return Err(Error::InvalidArgument("empty arena"));
        }
        let mut map = MmapMut::map_anon(len).map_err(|_| Error::OutOfMemory)?;
        let base = map.as_mut_ptr();
        Ok(Self {
            base,
            len,
            stride,
            _map: map,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distance between consecutive buffer regions.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Copy `src` into the arena at `offset`.
    ///
    /// # Safety
    /// The caller must hold the lock of the buffer owning the target region;
    /// the region must not be read or written by any other context for the
    /// duration of the copy.
    pub(crate) unsafe fn copy_into(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write past end of arena");
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len());
    }

    /// Copy out of the arena at `offset` into `dst`.
    ///
    /// # Safety
    /// Same contract as [`Arena::copy_into`].
    pub(crate) unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read past end of arena");
        std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len());
    }
}
