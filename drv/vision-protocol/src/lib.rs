//! Wire format and exchange logic for the Myriad vision coprocessor link:
//! header framing, CRC checks, and the write/read retry envelope around a
//! single transaction or poll. Sits directly on top of `drv-spi-transport`
//! and knows nothing about transaction slots, buffer pools, or threads —
//! that's `drv-transaction-table` and `task-vision-engine`.

mod crc;
mod error;
mod exchange;
mod header;

pub use error::ProtocolError;
pub use exchange::{
    header_exchange, receive_payload, send_payload, PayloadOutcome, MAX_READ_ATTEMPTS,
    MAX_WRITE_ATTEMPTS,
};
pub use header::{Header, HeaderFlags, HEADER_LEN};
