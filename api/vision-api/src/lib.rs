//! The per-open-instance surface most callers use instead of reaching
//! into `task-vision-engine` directly. Mirrors the original driver's
//! open/release/mmap/ioctl surface: an [`Instance`] is the host-side
//! analogue of a character device's open file description, owning its
//! own mmap buffer pool while sharing the underlying [`Device`] with
//! every other instance opened against it.

mod header;
mod mmap;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use drv_mmap_pool::MmapPool;
use task_vision_engine::Device;

pub use header::{UserFlags, UserHeader};
pub use mmap::MmapHandle;
pub use task_vision_engine::error::{BootError, SubmitError};
pub use task_vision_engine::DeviceConfig;

pub struct Instance {
    device: Arc<Device>,
    mmap_pool: MmapPool,
}

impl Instance {
    /// Open a new instance against an already-booted device.
    pub fn open(device: Arc<Device>) -> Self {
        Self { device, mmap_pool: MmapPool::new() }
    }

    /// Run the full reset procedure: cancel every in-flight transaction
    /// across every instance sharing this device, pulse reset, and
    /// re-stream firmware.
    pub fn reset(&self) -> Result<(), BootError> {
        self.device.reset()
    }

    /// Reserve a fresh mmap-backed buffer of at least `len` bytes. The
    /// returned handle owns the mapping until dropped; pass
    /// [`MmapHandle::page_offset`] to [`Instance::submit_mmap`] to use it.
    pub fn mmap(&self, len: usize) -> Result<MmapHandle<'_>, SubmitError> {
        let slot = self.mmap_pool.reserve(len)?;
        let (addr, mapped_len) = self
            .mmap_pool
            .addr(slot)
            .expect("slot was just reserved and cannot have been freed concurrently");
        Ok(MmapHandle::new(&self.mmap_pool, slot, addr, mapped_len))
    }

    /// Submit a request from an inline byte slice. `header.payload_len`
    /// must already describe `payload`'s length; `header.buffer_len_or_pgoff`
    /// is the capacity to allocate for the transaction (the response may
    /// be larger than the request, up to this limit). On return,
    /// `header`'s flags and `payload_len` describe the outcome; the
    /// response bytes (if any) are the `Ok` value.
    pub fn submit(
        &self,
        header: &mut UserHeader,
        payload: &[u8],
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>, SubmitError> {
        let buffer_len = header.buffer_len_or_pgoff as usize;
        if header.payload_len == 0
            || header.payload_len as usize > buffer_len
            || payload.len() != header.payload_len as usize
        {
            header.record_failure(UserFlags::empty());
            return Err(SubmitError::InvalidArgument);
        }

        let result = self.device.submit(
            payload,
            buffer_len,
            header.oneway(),
            Duration::from_millis(header.timeout_ms as u64),
            cancel,
        );
        match &result {
            Ok(response) => header.record_success(response.len()),
            Err(e) => header.record_failure(extra_flags_for(e)),
        }
        result
    }

    /// Submit a request already staged in a previously mmap-ed buffer
    /// (`header.buffer_len_or_pgoff` is ignored in favor of `handle`'s own
    /// capacity; `header.payload_len` is how much of it is the request).
    /// The response, if any, is copied back into the same buffer and
    /// `header.payload_len` updated to its length — the caller reads it
    /// back out of `handle` rather than from a returned `Vec`.
    pub fn submit_mmap(
        &self,
        header: &mut UserHeader,
        handle: &MmapHandle<'_>,
        cancel: &AtomicBool,
    ) -> Result<(), SubmitError> {
        let buffer_len = handle.len();
        let request_len = header.payload_len as usize;
        if request_len == 0 || request_len > buffer_len {
            header.record_failure(UserFlags::empty());
            return Err(SubmitError::InvalidArgument);
        }

        let (ptr, _mapped_len) = self.mmap_pool.use_buffer(handle.page_offset())?;
        // SAFETY: `use_buffer` just validated the slot and bumped its
        // refcount to reflect this borrow; `ptr` stays valid until the
        // matching `release` below.
        let request = unsafe { std::slice::from_raw_parts(ptr, request_len) };

        let result = self.device.submit(
            request,
            buffer_len,
            header.oneway(),
            Duration::from_millis(header.timeout_ms as u64),
            cancel,
        );

        let outcome = match &result {
            Ok(response) if !response.is_empty() => {
                // SAFETY: same mapping as above; `response.len() <=
                // buffer_len` is guaranteed by the engine never returning
                // more than the capacity it was given.
                let dest = unsafe { std::slice::from_raw_parts_mut(ptr, buffer_len) };
                dest[..response.len()].copy_from_slice(response);
                header.record_success(response.len());
                Ok(())
            }
            Ok(_) => {
                header.record_success(0);
                Ok(())
            }
            Err(e) => {
                header.record_failure(extra_flags_for(e));
                Err(())
            }
        };

        let _ = self.mmap_pool.release(handle.page_offset());
        match outcome {
            Ok(()) => Ok(()),
            Err(()) => Err(result.unwrap_err()),
        }
    }
}

/// The output flag bits implied by a [`SubmitError`] beyond the `ERROR`
/// bit every failure sets. `Overflow` also implies `ACKED`: the device
/// must have accepted the header for there to have been a response to
/// overflow on in the first place.
fn extra_flags_for(err: &SubmitError) -> UserFlags {
    match err {
        SubmitError::Timeout => UserFlags::TIMEOUT,
        SubmitError::Overflow => UserFlags::OVERFLOW | UserFlags::ACKED,
        SubmitError::Busy
        | SubmitError::InvalidArgument
        | SubmitError::Interrupted
        | SubmitError::Failed
        | SubmitError::MmapPool(_) => UserFlags::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use drv_spi_transport::{MockTransport, ScriptedExchange};
    use task_vision_engine::boot::StaticFirmwareLoader;

    fn test_device(exchange: ScriptedExchange) -> Arc<Device> {
        let transport: Box<dyn drv_spi_transport::Transport> = Box::new(MockTransport::new(exchange));
        let config = DeviceConfig {
            ongoing_poll_interval: StdDuration::from_millis(1),
            idle_poll_interval: StdDuration::from_millis(1),
            ..Default::default()
        };
        Device::open(transport, Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])), config).unwrap()
    }

    #[test]
    fn inline_submit_round_trips_and_reports_flags() {
        let device = test_device(ScriptedExchange::with_response(vec![9, 9, 9, 9]));
        let instance = Instance::open(device);

        let mut header = UserHeader {
            timeout_ms: 1000,
            buffer_len_or_pgoff: 64,
            payload_len: 4,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let response = instance.submit(&mut header, &[1, 2, 3, 4], &cancel).unwrap();
        assert_eq!(response, vec![9, 9, 9, 9]);
        assert!(header.flags.contains(UserFlags::ACKED));
        assert!(header.flags.contains(UserFlags::RESPONSE));
        assert!(!header.flags.contains(UserFlags::ERROR));
        assert_eq!(header.payload_len, 4);
    }

    #[test]
    fn inline_submit_rejects_payload_len_outside_buffer() {
        let device = test_device(ScriptedExchange::accepted());
        let instance = Instance::open(device);

        let mut header = UserHeader {
            timeout_ms: 1000,
            buffer_len_or_pgoff: 4,
            payload_len: 8,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let err = instance.submit(&mut header, &[0u8; 8], &cancel).unwrap_err();
        assert!(matches!(err, SubmitError::InvalidArgument));
        assert!(header.flags.contains(UserFlags::ERROR));
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn overflow_sets_acked_and_overflow_with_zero_payload_len() {
        let device = test_device(ScriptedExchange::with_response(vec![0xEE; 128]));
        let instance = Instance::open(device);

        let mut header = UserHeader {
            timeout_ms: 1000,
            buffer_len_or_pgoff: 64,
            payload_len: 4,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        let err = instance.submit(&mut header, &[1, 2, 3, 4], &cancel).unwrap_err();
        assert!(matches!(err, SubmitError::Overflow));
        assert!(header.flags.contains(UserFlags::ACKED));
        assert!(header.flags.contains(UserFlags::OVERFLOW));
        assert!(header.flags.contains(UserFlags::ERROR));
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn mmap_submit_round_trips_through_the_same_buffer() {
        let device = test_device(ScriptedExchange::with_response(vec![5, 6, 7]));
        let instance = Instance::open(device);

        let mut handle = instance.mmap(64).unwrap();
        handle.as_mut_slice()[..3].copy_from_slice(&[1, 2, 3]);

        let mut header = UserHeader {
            timeout_ms: 1000,
            payload_len: 3,
            ..Default::default()
        };
        let cancel = AtomicBool::new(false);
        instance.submit_mmap(&mut header, &handle, &cancel).unwrap();
        assert_eq!(&handle.as_slice()[..3], &[5, 6, 7]);
        assert_eq!(header.payload_len, 3);
        assert!(header.flags.contains(UserFlags::RESPONSE));
    }

    #[test]
    fn dropping_an_mmap_handle_frees_its_slot() {
        let device = test_device(ScriptedExchange::accepted());
        let instance = Instance::open(device);

        {
            let _handle = instance.mmap(64).unwrap();
        }
        // If the slot wasn't released, reserving all eight again plus one
        // more would exhaust the pool.
        let handles: Vec<_> = (0..drv_mmap_pool::POOL_SLOTS).map(|_| instance.mmap(64).unwrap()).collect();
        assert_eq!(handles.len(), drv_mmap_pool::POOL_SLOTS);
    }
}
