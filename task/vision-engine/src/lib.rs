//! The dispatcher and lifecycle manager for one Myriad vision coprocessor
//! link.
//!
//! This crate owns the dispatcher and lifecycle machinery: the single
//! dedicated worker thread that serializes all SPI protocol activity
//! against a [`drv_spi_transport::Transport`], the incoming/ongoing
//! scheduling between freshly submitted and already-dispatched
//! transactions, firmware boot, and the fatal-error/reset policy. Callers
//! build a [`Device`] once per physical (or simulated) link and call
//! [`Device::submit`] / [`Device::reset`] from as many threads as they
//! like; `vision-api` (this workspace's per-open-instance crate) is the
//! thin wrapper most callers actually use.

pub mod boot;
pub mod config;
mod device;
pub mod error;
pub mod trace;
mod worker;

pub use config::DeviceConfig;
pub use device::{Device, ONEWAY};
pub use trace::EngineEvent;
