//! The shared, thread-safe handle for one physical (or simulated) vision
//! coprocessor link: its transport, transaction table, firmware loader,
//! and the single dedicated worker thread that serializes all SPI traffic
//! against it. Mirrors the original driver's `visionbonnet_t`, with the
//! kernel mutex + workqueue replaced by a `std::sync::Mutex` around the
//! transport and a plain OS thread running [`crate::worker::run`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use drv_spi_transport::Transport;
use drv_transaction_table::{TransactionFlags, TransactionTable, WaitOutcome};

use crate::boot::FirmwareLoader;
use crate::config::DeviceConfig;
use crate::error::{BootError, SubmitError};
use crate::trace::EngineEvent;
use crate::worker;

use trace_log::TraceLog;

/// Bit the caller sets on a submitted transaction's request to mean
/// "don't wait for a response": the worker still runs the full header +
/// payload exchange, but `submit` returns as soon as the device acks it
/// rather than waiting for completion.
pub const ONEWAY: u32 = 0b0000_0001;

const EVENT_LOG_CAPACITY: usize = 1024;

pub struct Device {
    pub(crate) transport: Mutex<Box<dyn Transport>>,
    pub(crate) table: TransactionTable,
    pub(crate) firmware_loader: Box<dyn FirmwareLoader>,
    pub(crate) config: DeviceConfig,
    pub(crate) trace: Arc<TraceLog<EngineEvent>>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Build a device around `transport`, boot it with `firmware_loader`'s
    /// image, and spawn its dedicated worker thread. Returns once the
    /// device reports slave-ready or the boot procedure times out.
    pub fn open(
        transport: Box<dyn Transport>,
        firmware_loader: Box<dyn FirmwareLoader>,
        config: DeviceConfig,
    ) -> Result<Arc<Self>, BootError> {
        let device = Arc::new(Self {
            transport: Mutex::new(transport),
            table: TransactionTable::new(),
            firmware_loader,
            config,
            trace: Arc::new(TraceLog::new(EVENT_LOG_CAPACITY)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });

        device.boot()?;

        let worker_device = Arc::clone(&device);
        let shutdown = Arc::clone(&device.shutdown);
        let handle = std::thread::Builder::new()
            .name("vision-engine-worker".into())
            .spawn(move || worker::run(worker_device, shutdown))
            .expect("failed to spawn vision-engine worker thread");
        *device.worker.lock().unwrap() = Some(handle);

        Ok(device)
    }

    /// Shared handle to the device's event trace, for postmortem
    /// inspection or test assertions.
    pub fn trace(&self) -> Arc<TraceLog<EngineEvent>> {
        Arc::clone(&self.trace)
    }

    /// Re-run the full boot/reset procedure (cancel every in-flight
    /// transaction, pulse reset, re-stream firmware). The worker thread
    /// keeps running across a reset; it simply finds nothing left to do
    /// until new transactions are submitted.
    pub fn reset(&self) -> Result<(), BootError> {
        self.table.cancel_all();
        let result = self.boot();
        self.trace.record(EngineEvent::Reset);
        result
    }

    /// Re-run just the reset/boot pulse without cancelling in-flight
    /// transactions again. Called by the worker's fatal-error handler,
    /// which has already run [`drv_transaction_table::TransactionTable::cancel_all`]
    /// itself.
    pub(crate) fn reboot(&self) -> Result<(), BootError> {
        self.boot()
    }

    fn boot(&self) -> Result<(), BootError> {
        let mut transport = self.transport.lock().unwrap();
        let t = transport.as_mut();

        log::info!("resetting myriad");
        t.deassert_reset();
        t.sleep(self.config.reset_settle_duration);
        t.assert_reset();
        t.sleep(self.config.reset_assert_duration);
        t.deassert_reset();
        t.sleep(self.config.boot_settle_duration);

        t.clear_slave_ready();

        let firmware = self.firmware_loader.load()?;
        log::info!("writing myriad firmware ({} bytes)", firmware.len());
        drv_spi_transport::write_firmware_chunked(t, &firmware)?;

        log::info!("myriad booting");
        if !t.wait_slave_ready(self.config.boot_slave_ready_timeout) {
            log::error!("myriad did not boot in a timely fashion");
            return Err(BootError::NoSlaveReady);
        }
        log::info!("myriad ready");

        self.trace.record(EngineEvent::Booted);
        Ok(())
    }

    /// Submit a request transaction and, unless `oneway` is set, wait for
    /// its response. Implements the host-side equivalent of the original
    /// driver's `TRANSACT` ioctl: validate the request size, allocate a
    /// slot, hand it to the worker via the incoming queue, then block on
    /// the transaction's own condition until it's acked (and, unless
    /// one-way, responded to), times out, or is cancelled.
    ///
    /// Returns the response bytes (empty for a one-way submit or a
    /// write-only completion with no response data).
    pub fn submit(
        &self,
        payload: &[u8],
        buffer_len: usize,
        oneway: bool,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<Vec<u8>, SubmitError> {
        if payload.is_empty() || payload.len() > buffer_len {
            return Err(SubmitError::InvalidArgument);
        }

        let tid = self.table.alloc(buffer_len).ok_or(SubmitError::Busy)?;
        // The submitter's own reference, distinct from the one `alloc`
        // already took out on the incoming queue's behalf; see
        // `drv_transaction_table`'s module docs for why these are two
        // separate counts collapsed into one refcount.
        self.table.ref_slot(tid);
        self.table.set_payload(tid, payload);

        let required = if oneway {
            TransactionFlags::ACKED
        } else {
            TransactionFlags::ACKED | TransactionFlags::RESPONSE
        };

        let outcome = self.table.wait_flags_cancellable(tid, required, timeout, cancel);
        let result = match outcome {
            WaitOutcome::Ready(flags) => {
                if flags.contains(TransactionFlags::ERROR) {
                    Err(classify_error(flags))
                } else {
                    Ok(self.table.read_payload(tid))
                }
            }
            WaitOutcome::TimedOut => {
                self.table.set_flags(tid, TransactionFlags::ERROR | TransactionFlags::TIMEOUT);
                Err(SubmitError::Timeout)
            }
            WaitOutcome::Cancelled => {
                self.table.set_flags(tid, TransactionFlags::ERROR);
                Err(SubmitError::Interrupted)
            }
        };

        self.table.unref(tid);
        result
    }
}

fn classify_error(flags: TransactionFlags) -> SubmitError {
    if flags.contains(TransactionFlags::OVERFLOW) {
        SubmitError::Overflow
    } else if flags.contains(TransactionFlags::TIMEOUT) {
        SubmitError::Timeout
    } else {
        SubmitError::Failed
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
