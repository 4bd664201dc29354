use drv_spi_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport I/O failed: {0}")]
    Transport(#[from] TransportError),
    #[error("header CRC check failed on every read attempt")]
    BadCrc,
    #[error("peer nacked the transaction on every write attempt")]
    Nack,
    #[error("peer does not support this transaction type")]
    NotSupported,
    #[error("peer reported an invalid transaction id")]
    InvalidTid,
    #[error("payload CRC check failed")]
    PayloadCrcMismatch,
}

impl ProtocolError {
    /// Whether this error should trigger the device's fatal-error policy
    /// (cancel all transactions, optionally reset). A peer that just
    /// doesn't support a transaction type is recoverable at the
    /// transaction level; a header or payload CRC that never recovers, or
    /// a transport failure, leaves the link itself in an unknown state and
    /// is not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::BadCrc
                | ProtocolError::PayloadCrcMismatch
                | ProtocolError::Nack
        )
    }
}
