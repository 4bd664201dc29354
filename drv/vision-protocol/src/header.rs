//! The 8-byte header that precedes every transaction and poll exchange.
//!
//! Layout (little-endian):
//! ```text
//! byte 0      flags
//! byte 1      transaction id (0 reserved for polls)
//! bytes 2..4  CRC-16/XMODEM over [flags, transaction_id, size]
//! bytes 4..8  payload size
//! ```

use bitflags::bitflags;

use crate::crc::header_crc16;

pub const HEADER_LEN: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// Set by the peer to acknowledge the transaction id in this header.
        const ACK = 0b0000_0001;
        /// Set by the peer when the requested transaction type is supported.
        const IS_SUPPORTED = 0b0000_0010;
        /// Set by the peer to assert that the `transaction_id` field is
        /// meaningful (as opposed to a stale/zeroed placeholder).
        const TID_VALID = 0b0000_0100;
        /// Set when a payload follows (or, in a response, when response data
        /// accompanies this header).
        const HAS_DATA = 0b0000_1000;
        /// Set by the host on every header it writes; never by the device.
        const IS_MASTER = 0b0001_0000;
        /// Set by the peer once the named transaction has fully finished.
        const COMPLETE = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub flags: HeaderFlags,
    pub transaction_id: u8,
    pub size: u32,
}

impl Header {
    pub fn new(flags: HeaderFlags, transaction_id: u8, size: u32) -> Self {
        Self {
            flags,
            transaction_id,
            size,
        }
    }

    /// Flags the host sets on every header it writes, master-originated or
    /// not: ACK/IS_SUPPORTED/TID_VALID describe the host's own request as
    /// always well-formed and supported, leaving COMPLETE as the only bit
    /// that is purely the device's to set on its responses.
    const MASTER_BASE: HeaderFlags = HeaderFlags::ACK
        .union(HeaderFlags::IS_SUPPORTED)
        .union(HeaderFlags::TID_VALID)
        .union(HeaderFlags::IS_MASTER);

    /// The header the host writes to open a transaction.
    pub fn outgoing(transaction_id: u8, size: u32, has_data: bool) -> Self {
        let mut flags = Self::MASTER_BASE;
        if has_data {
            flags |= HeaderFlags::HAS_DATA;
        }
        Self::new(flags, transaction_id, size)
    }

    /// The header the host writes for a poll: transaction id 0, no payload.
    pub fn poll() -> Self {
        Self::new(Self::MASTER_BASE, 0, 0)
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.flags.bits();
        buf[1] = self.transaction_id;
        let crc = header_crc16(self.flags.bits(), self.transaction_id, self.size);
        buf[2..4].copy_from_slice(&crc.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        let flags = HeaderFlags::from_bits_truncate(buf[0]);
        let transaction_id = buf[1];
        let size = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        Self::new(flags, transaction_id, size)
    }

    /// Recompute the CRC-16 over a raw header and compare against the
    /// embedded value. Must be checked from the raw bytes, not from a
    /// round-tripped `Header`, since `from_bits_truncate` would silently
    /// drop unknown flag bits a corrupted header might set.
    pub fn crc_valid(buf: &[u8; HEADER_LEN]) -> bool {
        let expected = header_crc16(buf[0], buf[1], u32::from_le_bytes(buf[4..8].try_into().unwrap()));
        let actual = u16::from_le_bytes(buf[2..4].try_into().unwrap());
        expected == actual
    }

    /// Whether the reserved bits 6-7 of the flag byte are set. Checked
    /// against the raw byte, not a parsed `HeaderFlags`, since
    /// `from_bits_truncate` silently drops unknown bits.
    pub fn reserved_nonzero(buf: &[u8; HEADER_LEN]) -> bool {
        buf[0] & 0b1100_0000 != 0
    }

    pub fn ack(&self) -> bool {
        self.flags.contains(HeaderFlags::ACK)
    }

    pub fn is_supported(&self) -> bool {
        self.flags.contains(HeaderFlags::IS_SUPPORTED)
    }

    pub fn tid_valid(&self) -> bool {
        self.flags.contains(HeaderFlags::TID_VALID)
    }

    pub fn has_data(&self) -> bool {
        self.flags.contains(HeaderFlags::HAS_DATA)
    }

    pub fn complete(&self) -> bool {
        self.flags.contains(HeaderFlags::COMPLETE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let h = Header::new(HeaderFlags::ACK | HeaderFlags::COMPLETE, 7, 42);
        let bytes = h.to_bytes();
        assert!(Header::crc_valid(&bytes));
        let back = Header::from_bytes(&bytes);
        assert_eq!(h, back);
    }

    #[test]
    fn detects_corrupted_crc() {
        let h = Header::new(HeaderFlags::ACK, 3, 10);
        let mut bytes = h.to_bytes();
        bytes[2] ^= 0xFF;
        assert!(!Header::crc_valid(&bytes));
    }
}
