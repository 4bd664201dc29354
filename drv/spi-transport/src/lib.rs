//! SPI bulk transport for the Myriad vision coprocessor link.
//!
//! This crate owns the lowest layer of the engine: chunked reads/writes
//! against the physical (or simulated) SPI bus, chip-select toggling,
//! slave-ready gating, and the alert-success/alert-error signalling
//! conventions. Everything above this layer (`drv-vision-protocol`) only
//! ever calls [`Transport::write_chunked`] / [`Transport::read_chunked`] and
//! the alert/reset/frequency primitives; it never touches a raw SPI byte.

mod linux;
mod mock;
mod trace;

pub use linux::LinuxTransport;
pub use mock::{MockTransport, ScriptedExchange};
pub use trace::TransportEvent;

use std::time::Duration;

/// Largest chunk used for ordinary (post-boot) SPI transfers.
pub const MAX_SPI_CHUNK: usize = 4095;
/// Largest chunk used while streaming firmware at boot.
pub const MAX_SPI_BOOT_CHUNK: usize = 65535;
/// How long a chunked read/write waits for the slave-ready line.
pub const SLAVE_READY_TIMEOUT: Duration = Duration::from_millis(1000);
/// Extended slave-ready timeout used while waiting for the device to boot.
pub const SLAVE_READY_BOOT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("slave-ready line timed out after {0:?}")]
    SlaveReadyTimeout(Duration),
    #[error("SPI I/O failed: {0}")]
    Io(String),
}

/// The raw primitives a physical (or simulated) link must provide.
///
/// A single SPI bulk transfer is bounded by `MAX_SPI_CHUNK` /
/// `MAX_SPI_BOOT_CHUNK`; callers never ask for more than that in one call to
/// `raw_write`/`raw_read`.
pub trait Transport: Send {
    /// Perform one bounded SPI write of exactly `buf.len()` bytes.
    fn raw_write(&mut self, buf: &[u8]) -> Result<(), TransportError>;
    /// Perform one bounded SPI read of exactly `buf.len()` bytes.
    fn raw_read(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Lower (assert) chip-select.
    fn cs_low(&mut self);
    /// Raise (deassert) chip-select.
    fn cs_high(&mut self);

    /// Pulse chip-select high-low-high, the "alert-success" signal.
    fn pulse_alert_success(&mut self) {
        self.cs_high();
        self.cs_low();
        self.cs_high();
    }

    /// Pulse the master-error line low-high, the "alert-error" signal.
    fn pulse_alert_error(&mut self);

    fn assert_reset(&mut self);
    fn deassert_reset(&mut self);

    fn set_boot_frequency(&mut self) -> Result<(), TransportError>;
    fn set_normal_frequency(&mut self) -> Result<(), TransportError>;

    /// Block until the slave-ready line has been asserted at least once
    /// since the last call, consuming it. Returns `false` on timeout or on
    /// cancellation.
    fn wait_slave_ready(&mut self, timeout: Duration) -> bool;

    /// Discard any pending slave-ready edge without waiting for a new one.
    /// Called right before streaming firmware at boot, so a stale edge left
    /// over from before the reset pulse can't be mistaken for the device
    /// coming back up.
    fn clear_slave_ready(&mut self) {}

    /// Suspend the calling thread. Broken out as a trait method so the mock
    /// transport can make reset/boot delays instantaneous in tests instead
    /// of actually blocking for seconds.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// RAII guard that raises chip-select when dropped, used for the
/// single-CS-pulse firmware write in [`crate::Transport`] users. Mirrors the
/// `ControllerLock` drop-guard pattern the teacher's own SPI client API uses
/// to make "always release on every exit path" a type-level guarantee
/// instead of a `goto beach`.
pub struct ChipSelectGuard<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> ChipSelectGuard<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        transport.cs_low();
        Self { transport }
    }

    pub fn transport(&mut self) -> &mut T {
        self.transport
    }
}

impl<T: Transport + ?Sized> Drop for ChipSelectGuard<'_, T> {
    fn drop(&mut self) {
        self.transport.cs_high();
    }
}

/// Chunk a bounded write across `raw_write`, gating each chunk on
/// slave-ready: every chunk toggles CS low/high around the transfer and
/// is gated on slave-ready with a 1 s timeout.
pub fn write_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    mut buf: &[u8],
) -> Result<(), TransportError> {
    while !buf.is_empty() {
        if !transport.wait_slave_ready(SLAVE_READY_TIMEOUT) {
            return Err(TransportError::SlaveReadyTimeout(SLAVE_READY_TIMEOUT));
        }
        let chunk_len = buf.len().min(MAX_SPI_CHUNK);
        transport.cs_low();
        let result = transport.raw_write(&buf[..chunk_len]);
        transport.cs_high();
        result?;
        buf = &buf[chunk_len..];
    }
    Ok(())
}

/// Chunk a bounded read across `raw_read`. When `in_place` is set, every
/// chunk overwrites the same region of `buf` (used to drain and discard an
/// oversized response); otherwise the write position advances.
pub fn read_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    in_place: bool,
) -> Result<(), TransportError> {
    let mut remaining = buf.len();
    let mut offset = 0;
    while remaining > 0 {
        if !transport.wait_slave_ready(SLAVE_READY_TIMEOUT) {
            return Err(TransportError::SlaveReadyTimeout(SLAVE_READY_TIMEOUT));
        }
        let chunk_len = remaining.min(MAX_SPI_CHUNK);
        let dest = if in_place {
            &mut buf[..chunk_len]
        } else {
            &mut buf[offset..offset + chunk_len]
        };
        transport.cs_low();
        let result = transport.raw_read(dest);
        transport.cs_high();
        result?;
        remaining -= chunk_len;
        if !in_place {
            offset += chunk_len;
        }
    }
    Ok(())
}

/// Stream a firmware blob at boot frequency in up to `MAX_SPI_BOOT_CHUNK`
/// byte chunks, holding chip-select low across the entire transfer.
/// Unlike `write_chunked`, firmware bytes are not gated on slave-ready:
/// the device is still executing its boot ROM and has not yet brought up
/// the protocol link.
pub fn write_firmware_chunked<T: Transport + ?Sized>(
    transport: &mut T,
    mut data: &[u8],
) -> Result<(), TransportError> {
    transport.set_boot_frequency()?;
    let mut guard = ChipSelectGuard::new(transport);
    while !data.is_empty() {
        let chunk_len = data.len().min(MAX_SPI_BOOT_CHUNK);
        guard.transport().raw_write(&data[..chunk_len])?;
        data = &data[chunk_len..];
    }
    drop(guard);
    transport.set_normal_frequency()?;
    Ok(())
}
