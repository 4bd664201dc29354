//! Checksums used on the wire: CRC-16/XMODEM over every header, CRC-32 (the
//! reflected, final-XOR'd ISO-HDLC variant, i.e. the everyday "CRC-32") over
//! every payload.

use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn header_crc16(flags: u8, transaction_id: u8, size: u32) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&[flags, transaction_id]);
    digest.update(&size.to_le_bytes());
    digest.finalize()
}

pub fn payload_crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}
