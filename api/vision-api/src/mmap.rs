//! A caller-held handle onto one of an [`crate::Instance`]'s mmap-backed
//! buffer-pool slots. Stands in for the original driver's vma: instead of
//! a `close` callback releasing the slot when the kernel tears down the
//! mapping, `Drop` releases it when the handle goes out of scope.

use drv_mmap_pool::MmapPool;

pub struct MmapHandle<'a> {
    pool: &'a MmapPool,
    slot: usize,
    addr: *mut u8,
    len: usize,
}

impl<'a> MmapHandle<'a> {
    pub(crate) fn new(pool: &'a MmapPool, slot: usize, addr: *mut u8, len: usize) -> Self {
        Self { pool, slot, addr, len }
    }

    /// The page-offset key identifying this buffer to `Instance::submit_mmap`.
    pub fn page_offset(&self) -> usize {
        self.slot
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `addr` is a page-aligned anonymous mapping of at least
        // `len` bytes owned by `pool`, kept alive for the lifetime of
        // this handle by the pool's own refcount.
        unsafe { std::slice::from_raw_parts(self.addr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` guarantees no other handle
        // is concurrently reading through `as_slice`.
        unsafe { std::slice::from_raw_parts_mut(self.addr, self.len) }
    }
}

impl Drop for MmapHandle<'_> {
    fn drop(&mut self) {
        // The pool's own bookkeeping is the source of truth for whether
        // this is the buffer's last reference; a stale handle outliving
        // its instance would already have failed earlier operations.
        let _ = self.pool.release(self.slot);
    }
}
