//! Firmware acquisition for device boot/reset.
//!
//! The original driver pulled its firmware blob through the kernel's
//! `request_firmware()`, which resolves a name against
//! `/lib/firmware` and hands back a read-only blob. `FirmwareLoader` is the
//! host-process stand-in: a small trait so a real deployment can read the
//! blob from disk on every reset (picking up an updated image without a
//! restart) while tests substitute a fixed in-memory image.

use std::fs;
use std::path::PathBuf;

use crate::error::LoaderError;

/// Firmware images larger than this are rejected before anything is
/// streamed to the device. Indicative ceiling, not a protocol limit.
pub const MAX_FIRMWARE_LEN: usize = 10 * 1024 * 1024;

/// Supplies the firmware blob streamed to the device on every boot/reset.
/// Implementations are free to re-read their source each call; `Device`
/// calls `load()` fresh every time it reboots rather than caching the
/// result itself.
pub trait FirmwareLoader: Send + Sync {
    fn load(&self) -> Result<Vec<u8>, LoaderError>;
}

/// Reads the firmware blob from a path on disk, the host analogue of
/// resolving a `request_firmware()` name against `/lib/firmware`.
pub struct FileFirmwareLoader {
    path: PathBuf,
}

impl FileFirmwareLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FirmwareLoader for FileFirmwareLoader {
    fn load(&self) -> Result<Vec<u8>, LoaderError> {
        let data = fs::read(&self.path)?;
        if data.len() > MAX_FIRMWARE_LEN {
            return Err(LoaderError::TooLarge);
        }
        Ok(data)
    }
}

/// Hands back a fixed, in-memory firmware image. Used by tests and by
/// callers that have already resolved their firmware blob some other way.
pub struct StaticFirmwareLoader {
    image: Vec<u8>,
}

impl StaticFirmwareLoader {
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }
}

impl FirmwareLoader for StaticFirmwareLoader {
    fn load(&self) -> Result<Vec<u8>, LoaderError> {
        if self.image.len() > MAX_FIRMWARE_LEN {
            return Err(LoaderError::TooLarge);
        }
        Ok(self.image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_loader_returns_its_image() {
        let loader = StaticFirmwareLoader::new(vec![0xAA; 16]);
        assert_eq!(loader.load().unwrap(), vec![0xAA; 16]);
    }

    #[test]
    fn static_loader_rejects_oversized_image() {
        let loader = StaticFirmwareLoader::new(vec![0u8; MAX_FIRMWARE_LEN + 1]);
        assert!(matches!(loader.load(), Err(LoaderError::TooLarge)));
    }

    #[test]
    fn file_loader_reads_back_written_bytes() {
        let mut path = std::env::temp_dir();
        path.push(format!("vision-engine-test-fw-{:?}", std::thread::current().id()));
        fs::write(&path, [1, 2, 3, 4]).unwrap();
        let loader = FileFirmwareLoader::new(&path);
        assert_eq!(loader.load().unwrap(), vec![1, 2, 3, 4]);
        let _ = fs::remove_file(&path);
    }
}
