//! Manual exerciser for a real vision bonnet, the host-side analogue of
//! the original repo's own `debug-net-client`: a small standalone binary
//! for poking at one device from a terminal instead of writing a test.

use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use drv_spi_transport::LinuxTransport;
use task_vision_engine::boot::FileFirmwareLoader;
use task_vision_engine::{Device, DeviceConfig};
use vision_api::{Instance, UserFlags, UserHeader};

#[derive(Parser, Debug)]
#[clap(max_term_width = 100, about = "manual exerciser for a vision bonnet")]
struct Args {
    /// SPI device node, e.g. /dev/spidev0.0
    #[clap(long, default_value = "/dev/spidev0.0")]
    spi: String,

    /// Chip-select GPIO line number
    #[clap(long, default_value_t = 8)]
    cs_line: u32,

    /// Reset GPIO line number
    #[clap(long, default_value_t = 25)]
    reset_line: u32,

    /// Slave-ready GPIO line number
    #[clap(long, default_value_t = 5)]
    slave_ready_line: u32,

    /// Master-error GPIO line number
    #[clap(long, default_value_t = 6)]
    master_error_line: u32,

    /// Normal-operation SPI clock, in Hz
    #[clap(long, default_value_t = 8_000_000)]
    speed_hz: u32,

    /// Boot-time SPI clock, in Hz
    #[clap(long, default_value_t = 13_800_000)]
    boot_speed_hz: u32,

    /// Path to the firmware blob to stream on boot/reset
    #[clap(long)]
    firmware: std::path::PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reboot the device: cancel in-flight work, pulse reset, re-stream
    /// firmware.
    Reset,
    /// Submit one request and print the response.
    Transact {
        /// Request bytes, as hex (e.g. deadbeef)
        #[clap(long)]
        hex: String,
        /// Capacity to allocate for the transaction's response buffer
        #[clap(long, default_value_t = 4096)]
        buffer_len: u32,
        /// Wait for the device's ack only, not its response
        #[clap(long)]
        oneway: bool,
        /// Milliseconds to wait before giving up
        #[clap(long, default_value_t = 1000)]
        timeout_ms: u32,
    },
    /// Print whether the device is currently reachable.
    Status,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let transport = LinuxTransport::open(
        &args.spi,
        args.cs_line,
        args.reset_line,
        args.slave_ready_line,
        args.master_error_line,
        args.speed_hz,
        args.boot_speed_hz,
    )
    .with_context(|| format!("failed to open SPI transport at {}", args.spi))?;

    let device = Device::open(
        Box::new(transport),
        Box::new(FileFirmwareLoader::new(&args.firmware)),
        DeviceConfig::default(),
    )
    .context("device failed to boot")?;
    let instance = Instance::open(device);

    match args.command {
        Command::Reset => {
            instance.reset().context("reset failed")?;
            info!("device reset and firmware re-streamed");
        }
        Command::Transact { hex, buffer_len, oneway, timeout_ms } => {
            let payload = decode_hex(&hex).context("--hex is not valid hex")?;
            let mut header = UserHeader {
                flags: if oneway { UserFlags::ONEWAY } else { UserFlags::empty() },
                timeout_ms,
                buffer_len_or_pgoff: buffer_len,
                payload_len: payload.len() as u32,
            };
            let cancel = AtomicBool::new(false);
            match instance.submit(&mut header, &payload, &cancel) {
                Ok(response) => {
                    info!("transaction complete: flags={:?} response={}", header.flags, encode_hex(&response));
                }
                Err(e) => {
                    info!("transaction failed: {e} (flags={:?})", header.flags);
                    return Err(e.into());
                }
            }
        }
        Command::Status => {
            // A zero-byte poll-style probe: one-way submit with the
            // smallest possible payload, just to see whether the device
            // still acknowledges requests.
            let mut header = UserHeader {
                flags: UserFlags::ONEWAY,
                timeout_ms: 250,
                buffer_len_or_pgoff: 1,
                payload_len: 1,
            };
            let cancel = AtomicBool::new(false);
            match instance.submit(&mut header, &[0u8], &cancel) {
                Ok(_) => println!("reachable"),
                Err(e) => {
                    println!("unreachable: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(anyhow::Error::from))
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
