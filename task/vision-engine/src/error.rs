use drv_mmap_pool::MmapPoolError;
use drv_spi_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("firmware image exceeds the maximum supported size")]
    TooLarge,
    #[error("failed to read firmware image: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("transport error during boot: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to load firmware: {0}")]
    Loader(#[from] LoaderError),
    #[error("device did not assert slave-ready within the boot timeout")]
    NoSlaveReady,
}

/// Outcome of a submitted transaction, once it reaches the caller. Kept
/// deliberately coarse: by the time a waiter wakes, the fine-grained reason
/// lives in the transaction's `TransactionFlags`, not in a wrapped protocol
/// error, so this just names the bucket the caller needs to branch on.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("all transaction slots are in use")]
    Busy,
    #[error("payload_len must be in (0, buffer_len]")]
    InvalidArgument,
    #[error("operation timed out waiting for the device")]
    Timeout,
    #[error("operation was cancelled")]
    Interrupted,
    #[error("the response was larger than the caller's buffer")]
    Overflow,
    #[error("the device reported or was found in an error state")]
    Failed,
    #[error("mmap buffer pool error: {0}")]
    MmapPool(#[from] MmapPoolError),
}
