//! Real hardware backend: a Linux `/dev/spidevN.M` character device for the
//! SPI bus plus three GPIO lines (reset, slave-ready, master-error) driven
//! through the GPIO character-device ioctl interface.
//!
//! This mirrors the way `rppal` talks to the same peripherals: open the
//! device node, drive it with raw `ioctl`s from `libc`, no kernel-bypass
//! library in between. We don't pull in `rppal` itself because it owns pin
//! numbering and chip-select policy we need to control directly (the boot
//! sequence holds CS low across a single multi-megabyte transfer, which is
//! not an operation `rppal`'s `Spi` exposes).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::{Transport, TransportError};

const SPI_IOC_MAGIC: u8 = b'k';

fn ioc(dir: u32, nr: u8, size: usize) -> libc::c_ulong {
    const IOC_WRITE: u32 = 1;
    const IOC_READ: u32 = 2;
    const NRSHIFT: u32 = 0;
    const TYPESHIFT: u32 = 8;
    const SIZESHIFT: u32 = 16;
    const DIRSHIFT: u32 = 30;
    ((dir << DIRSHIFT)
        | ((SPI_IOC_MAGIC as u32) << TYPESHIFT)
        | ((nr as u32) << NRSHIFT)
        | ((size as u32) << SIZESHIFT)) as libc::c_ulong
}

#[repr(C)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    pad: u16,
}

/// GPIO line exported via `/sys/class/gpio` and then accessed as a plain
/// file, the lowest-ceremony way to flip a line from a long-lived process
/// without keeping a `gpiochip` fd and a line-request handle alive.
struct GpioLine {
    value: File,
}

impl GpioLine {
    fn open(line: u32) -> io::Result<Self> {
        let export_path = "/sys/class/gpio/export";
        if std::fs::metadata(format!("/sys/class/gpio/gpio{line}")).is_err() {
            std::fs::write(export_path, line.to_string().as_bytes()).ok();
        }
        let value = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/sys/class/gpio/gpio{line}/value"))?;
        Ok(Self { value })
    }

    fn set(&mut self, high: bool) {
        use std::io::Write;
        let _ = self.value.write_all(if high { b"1" } else { b"0" });
    }

    fn read(&mut self) -> bool {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = [0u8; 1];
        let _ = self.value.seek(SeekFrom::Start(0));
        let _ = self.value.read_exact(&mut buf);
        buf[0] == b'1'
    }
}

/// Interrupt-driven slave-ready edge, shared between the line-polling thread
/// and whoever calls [`Transport::wait_slave_ready`].
#[derive(Default)]
struct SlaveReadyState {
    asserted: bool,
}

pub struct LinuxTransport {
    spi: File,
    cs: GpioLine,
    reset: GpioLine,
    master_error: GpioLine,
    slave_ready_state: Arc<(Mutex<SlaveReadyState>, Condvar)>,
    poll_stop: Arc<AtomicBool>,
    speed_hz: u32,
    boot_speed_hz: u32,
    normal_speed_hz: u32,
}

impl LinuxTransport {
    /// Open a SPI device node plus the GPIO lines the vision bonnet wires up
    /// for boot/handshake control. `cs_line` is driven by hand rather than
    /// left to spidev's automatic per-transfer chip-select, because the
    /// alert pulses and the boot firmware stream both need chip-select held
    /// or toggled independently of a data transfer.
    pub fn open(
        spi_path: &str,
        cs_line: u32,
        reset_line: u32,
        slave_ready_line: u32,
        master_error_line: u32,
        normal_speed_hz: u32,
        boot_speed_hz: u32,
    ) -> Result<Self, TransportError> {
        log::info!("opening spi transport at {spi_path} (cs={cs_line} reset={reset_line} slave_ready={slave_ready_line})");
        let spi = OpenOptions::new()
            .read(true)
            .write(true)
            .open(spi_path)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let cs = GpioLine::open(cs_line).map_err(|e| TransportError::Io(e.to_string()))?;
        let reset = GpioLine::open(reset_line).map_err(|e| TransportError::Io(e.to_string()))?;
        let master_error =
            GpioLine::open(master_error_line).map_err(|e| TransportError::Io(e.to_string()))?;
        let slave_ready_state = Arc::new((Mutex::new(SlaveReadyState::default()), Condvar::new()));
        let poll_stop = Arc::new(AtomicBool::new(false));

        {
            let mut ready_line =
                GpioLine::open(slave_ready_line).map_err(|e| TransportError::Io(e.to_string()))?;
            let state = Arc::clone(&slave_ready_state);
            let stop = Arc::clone(&poll_stop);
            std::thread::spawn(move || {
                let mut last = ready_line.read();
                while !stop.load(Ordering::Relaxed) {
                    let now = ready_line.read();
                    if now && !last {
                        let (lock, cvar) = &*state;
                        lock.lock().unwrap().asserted = true;
                        cvar.notify_all();
                    }
                    last = now;
                    std::thread::sleep(Duration::from_micros(200));
                }
            });
        }

        Ok(Self {
            spi,
            cs,
            reset,
            master_error,
            slave_ready_state,
            poll_stop,
            speed_hz: normal_speed_hz,
            boot_speed_hz,
            normal_speed_hz,
        })
    }

    fn transfer(&mut self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<(), TransportError> {
        let len = tx.as_ref().map(|b| b.len()).or(rx.as_deref().map(|b| b.len())).unwrap_or(0);
        let tx_ptr = tx.map(|b| b.as_ptr() as u64).unwrap_or(0);
        let rx_ptr = rx.map(|b| b.as_mut_ptr() as u64).unwrap_or(0);
        let mut xfer = SpiIocTransfer {
            tx_buf: tx_ptr,
            rx_buf: rx_ptr,
            len: len as u32,
            speed_hz: self.speed_hz,
            delay_usecs: 0,
            bits_per_word: 8,
            cs_change: 0,
            tx_nbits: 0,
            rx_nbits: 0,
            pad: 0,
        };
        let request = ioc(1 | 2, 0, std::mem::size_of::<SpiIocTransfer>());
        let ret = unsafe {
            libc::ioctl(
                self.spi.as_raw_fd(),
                request,
                &mut xfer as *mut SpiIocTransfer,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            log::warn!("spi ioctl transfer failed: {err}");
            return Err(TransportError::Io(err.to_string()));
        }
        Ok(())
    }
}

impl Drop for LinuxTransport {
    fn drop(&mut self) {
        self.poll_stop.store(true, Ordering::Relaxed);
    }
}

impl Transport for LinuxTransport {
    fn raw_write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.transfer(Some(buf), None)
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.transfer(None, Some(buf))
    }

    fn cs_low(&mut self) {
        self.cs.set(false);
    }

    fn cs_high(&mut self) {
        self.cs.set(true);
    }

    fn pulse_alert_error(&mut self) {
        self.master_error.set(false);
        self.master_error.set(true);
    }

    fn assert_reset(&mut self) {
        self.reset.set(false);
    }

    fn deassert_reset(&mut self) {
        self.reset.set(true);
    }

    fn set_boot_frequency(&mut self) -> Result<(), TransportError> {
        self.speed_hz = self.boot_speed_hz;
        Ok(())
    }

    fn set_normal_frequency(&mut self) -> Result<(), TransportError> {
        self.speed_hz = self.normal_speed_hz;
        Ok(())
    }

    fn clear_slave_ready(&mut self) {
        let (lock, _cvar) = &*self.slave_ready_state;
        lock.lock().unwrap().asserted = false;
    }

    fn wait_slave_ready(&mut self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.slave_ready_state;
        let guard = lock.lock().unwrap();
        let (mut guard, result) = cvar
            .wait_timeout_while(guard, timeout, |s| !s.asserted)
            .unwrap();
        let ready = guard.asserted;
        guard.asserted = false;
        !result.timed_out() && ready
    }
}
