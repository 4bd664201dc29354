//! Per-device pool of page-aligned, `mmap`-backed I/O buffers.
//!
//! The original driver let a caller `mmap()` the character device directly
//! and handed back a buffer backed by kernel pages instead of copying
//! through a `read`/`write` pair. We're a single host process with no
//! userspace/kernelspace split to bridge, but the pool still earns its keep
//! as a zero-copy path for large transfers: a transaction can be told to
//! fill one of these buffers directly rather than bouncing through the
//! transaction table's own heap buffer. Each pool holds up to
//! [`POOL_SLOTS`] buffers, same as the original's per-open-instance limit.

use std::sync::Mutex;

pub const POOL_SLOTS: usize = 8;

/// The three states a slot's refcount directly encodes: 0 is free, 1 is
/// reserved/allocated (owned by its mmap handle but not currently handed
/// to a transaction), 2 is in-use-by-transaction. This is derived from
/// the refcount rather than tracked separately, so the two can never
/// drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Allocated,
    InUse,
}

impl BufferState {
    fn from_refcount(refcount: u32) -> Self {
        match refcount {
            0 => BufferState::Free,
            1 => BufferState::Allocated,
            _ => BufferState::InUse,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MmapPoolError {
    #[error("all {POOL_SLOTS} mmap buffer slots are in use")]
    PoolExhausted,
    #[error("mmap(2) failed: {0}")]
    Mmap(std::io::Error),
    #[error("no such buffer slot")]
    NoSuchSlot,
    #[error("buffer slot is not in the expected state")]
    WrongState,
    #[error("requested range overlaps an already-allocated buffer")]
    Overlap,
}

struct Slot {
    addr: *mut libc::c_void,
    mapped_len: usize,
    refcount: u32,
}

// `addr` is an opaque anonymous mapping owned exclusively by this pool;
// nothing aliases it outside of the `&mut [u8]` we hand out while `InUse`.
unsafe impl Send for Slot {}

impl Slot {
    fn empty() -> Self {
        Self {
            addr: std::ptr::null_mut(),
            mapped_len: 0,
            refcount: 0,
        }
    }

    fn state(&self) -> BufferState {
        BufferState::from_refcount(self.refcount)
    }

    fn range(&self) -> (usize, usize) {
        (self.addr as usize, self.addr as usize + self.mapped_len)
    }
}

fn page_align(len: usize) -> usize {
    let page = page_size();
    (len + page - 1) / page * page
}

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a real Linux system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub struct MmapPool {
    slots: Mutex<Vec<Slot>>,
}

impl Default for MmapPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapPool {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new((0..POOL_SLOTS).map(|_| Slot::empty()).collect()),
        }
    }

    /// Map a fresh, page-aligned anonymous buffer of at least `len` bytes
    /// and claim a free slot for it. The slot starts at refcount 1 (its
    /// owning handle's own reference) — `Allocated`, not yet handed to any
    /// transaction. Returns the slot index, stable for the buffer's
    /// lifetime.
    pub fn reserve(&self, len: usize) -> Result<usize, MmapPoolError> {
        let mapped_len = page_align(len.max(1));
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MmapPoolError::Mmap(std::io::Error::last_os_error()));
        }

        let mut slots = self.slots.lock().unwrap();
        let new_range = (addr as usize, addr as usize + mapped_len);
        for slot in slots.iter() {
            if slot.state() == BufferState::Free {
                continue;
            }
            let (s, e) = slot.range();
            if new_range.0 < e && s < new_range.1 {
                unsafe { libc::munmap(addr, mapped_len) };
                return Err(MmapPoolError::Overlap);
            }
        }

        match slots.iter().position(|s| s.state() == BufferState::Free) {
            Some(idx) => {
                slots[idx] = Slot {
                    addr,
                    mapped_len,
                    refcount: 1,
                };
                Ok(idx)
            }
            None => {
                unsafe { libc::munmap(addr, mapped_len) };
                Err(MmapPoolError::PoolExhausted)
            }
        }
    }

    /// Hand a reserved (refcount 1) buffer to a transaction, moving it to
    /// `InUse` (refcount 2), and return a raw pointer/length pair for it.
    /// Rejected if the slot is free (nothing reserved) or already in use
    /// by another transaction — only one transaction may touch a buffer at
    /// a time. Returns a raw pointer rather than a `&mut [u8]` because two
    /// holders (the owning handle and the transaction) have a live
    /// reference to the same memory for the duration of the exchange;
    /// building a Rust slice is each caller's own job.
    pub fn use_buffer(&self, index: usize) -> Result<(*mut u8, usize), MmapPoolError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(index).ok_or(MmapPoolError::NoSuchSlot)?;
        if slot.state() != BufferState::Allocated {
            return Err(MmapPoolError::WrongState);
        }
        slot.refcount += 1;
        Ok((slot.addr as *mut u8, slot.mapped_len))
    }

    /// Drop a reference to a slot's buffer: a transaction finishing with it
    /// (`InUse` -> `Allocated`) or its owning handle being dropped
    /// (`Allocated` -> `Free`, unmapping the buffer). Whichever drops the
    /// refcount to zero is the one that unmaps.
    pub fn release(&self, index: usize) -> Result<(), MmapPoolError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(index).ok_or(MmapPoolError::NoSuchSlot)?;
        if slot.state() == BufferState::Free {
            return Err(MmapPoolError::WrongState);
        }
        slot.refcount -= 1;
        if slot.refcount == 0 {
            unsafe { libc::munmap(slot.addr, slot.mapped_len) };
            *slot = Slot::empty();
        }
        Ok(())
    }

    /// Find the slot (if any) whose mapped range contains `addr`, used to
    /// resolve a buffer passed back in by address.
    pub fn find(&self, addr: *const u8) -> Option<usize> {
        let slots = self.slots.lock().unwrap();
        let addr = addr as usize;
        slots.iter().position(|slot| {
            slot.state() != BufferState::Free && {
                let (s, e) = slot.range();
                addr >= s && addr < e
            }
        })
    }

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.slots.lock().unwrap().get(index).map(|s| s.state())
    }

    /// The address and mapped length of a non-free slot, without
    /// affecting its refcount. Lets a buffer's owner (who already holds
    /// the reference `reserve` gave it) get at the memory without going
    /// through `use_buffer`, which is reserved for handing the buffer to
    /// a transaction.
    pub fn addr(&self, index: usize) -> Option<(*mut u8, usize)> {
        let slots = self.slots.lock().unwrap();
        let slot = slots.get(index)?;
        if slot.state() == BufferState::Free {
            return None;
        }
        Some((slot.addr as *mut u8, slot.mapped_len))
    }
}

impl Drop for MmapPool {
    fn drop(&mut self) {
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            if slot.state() != BufferState::Free {
                unsafe { libc::munmap(slot.addr, slot.mapped_len) };
            }
        }
    }
}
