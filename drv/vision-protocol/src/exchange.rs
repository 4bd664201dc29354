//! The read/write/retry envelope around a single header or payload
//! exchange. Everything here is synchronous and blocking: it is always
//! called from the single device worker thread, never concurrently for the
//! same transport.

use drv_spi_transport::{read_chunked, write_chunked, Transport, MAX_SPI_CHUNK};

use crate::crc::payload_crc32;
use crate::error::ProtocolError;
use crate::header::{Header, HEADER_LEN};

/// Retry budget for a single header exchange. A write attempt is consumed
/// only when the peer explicitly nacks; a CRC-corrupted read is retried
/// without consuming a write attempt.
pub const MAX_WRITE_ATTEMPTS: u32 = 100;
pub const MAX_READ_ATTEMPTS: u32 = 100;

/// Outcome of validating one raw incoming header, in the precedence order
/// the protocol defines: a corrupted header is reported before anything
/// else is trusted; an unsupported transaction type or an invalid id are
/// terminal even if the peer happened to also leave ACK clear; only once
/// those are ruled out does a clear ACK bit mean "nack, retry the write".
enum Validation {
    BadCrc,
    NotSupported,
    InvalidTid,
    Nack,
    Ok(Header),
}

fn validate(buf: &[u8; HEADER_LEN]) -> Validation {
    if !Header::crc_valid(buf) {
        return Validation::BadCrc;
    }
    let incoming = Header::from_bytes(buf);
    if Header::reserved_nonzero(buf) || !incoming.is_supported() {
        return Validation::NotSupported;
    }
    if !incoming.tid_valid() {
        return Validation::InvalidTid;
    }
    if !incoming.ack() {
        return Validation::Nack;
    }
    Validation::Ok(incoming)
}

/// Drive one write-then-retry-reads round against `transport`, calling
/// `write` to (re)send the outgoing side on every write attempt. Shared by
/// [`header_exchange`] (which just resends the same header) and
/// [`send_payload`] (which resends the payload and its CRC). Returns the
/// peer's header once it acks, or a terminal [`ProtocolError`] once the
/// relevant retry budget is spent; a header-CRC exhaustion ends the whole
/// exchange immediately rather than triggering another write attempt, per
/// the protocol's retry envelope.
fn exchange_with_retries<T: Transport + ?Sized>(
    transport: &mut T,
    mut write: impl FnMut(&mut T) -> Result<(), ProtocolError>,
) -> Result<Header, ProtocolError> {
    for _write_attempt in 0..MAX_WRITE_ATTEMPTS {
        write(transport)?;
        let mut nacked = false;
        for _read_attempt in 0..MAX_READ_ATTEMPTS {
            let mut buf = [0u8; HEADER_LEN];
            read_chunked(transport, &mut buf, false)?;
            match validate(&buf) {
                Validation::BadCrc => {
                    transport.pulse_alert_error();
                    continue;
                }
                Validation::NotSupported => {
                    transport.pulse_alert_success();
                    return Err(ProtocolError::NotSupported);
                }
                Validation::InvalidTid => {
                    transport.pulse_alert_success();
                    return Err(ProtocolError::InvalidTid);
                }
                Validation::Nack => {
                    transport.pulse_alert_success();
                    nacked = true;
                    break;
                }
                Validation::Ok(incoming) => {
                    transport.pulse_alert_success();
                    return Ok(incoming);
                }
            }
        }
        if !nacked {
            // Read attempts exhausted without ever seeing a clean header:
            // the link itself is suspect, so stop here rather than spend
            // another write attempt on it.
            return Err(ProtocolError::BadCrc);
        }
    }
    // Every write attempt got a clean, explicit nack: the peer is responsive
    // but refuses the transaction, not a link-level CRC problem.
    Err(ProtocolError::Nack)
}

/// Write `outgoing`, then read back the peer's response header, retrying on
/// bad CRC (read side) and on explicit nack (write side, which rewrites the
/// same outgoing header).
pub fn header_exchange<T: Transport + ?Sized>(
    transport: &mut T,
    outgoing: Header,
) -> Result<Header, ProtocolError> {
    let bytes = outgoing.to_bytes();
    exchange_with_retries(transport, |t| write_chunked(t, &bytes).map_err(Into::into))
}

/// Send a payload followed by its CRC-32, then read the peer's
/// acknowledgement header, retrying the whole write (payload + CRC) on
/// nack and just the read on bad CRC.
pub fn send_payload<T: Transport + ?Sized>(
    transport: &mut T,
    payload: &[u8],
) -> Result<Header, ProtocolError> {
    let crc = payload_crc32(payload).to_le_bytes();
    exchange_with_retries(transport, |t| {
        write_chunked(t, payload)?;
        write_chunked(t, &crc)?;
        Ok(())
    })
}

/// Outcome of receiving a response payload against a fixed-capacity
/// destination buffer.
pub enum PayloadOutcome {
    /// The payload fit; `len` bytes of `buf` hold it and its CRC checked
    /// out.
    Received { len: usize },
    /// The payload was larger than the caller's capacity. The bytes (and
    /// their CRC) were still drained off the wire to keep the link framed,
    /// but discarded; the CRC is not checked in this case since there is
    /// nowhere to report a mismatch that matters.
    Overflow { size: u32 },
}

/// Receive `size` bytes of response payload into `buf`, honoring
/// `capacity` (the transaction's originally requested buffer size, which
/// may be smaller than `buf.len()`). An overflowing response is drained
/// and discarded without a CRC check, matching the original driver; a
/// payload that fits is re-read (same size, same offset) up to
/// `MAX_READ_ATTEMPTS` times if its CRC-32 doesn't check out, pulsing
/// alert-error on every mismatch and alert-success once it does.
pub fn receive_payload<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    capacity: usize,
    size: u32,
) -> Result<PayloadOutcome, ProtocolError> {
    if size as usize > capacity {
        drain_discard(transport, size)?;
        let mut crc_buf = [0u8; 4];
        read_chunked(transport, &mut crc_buf, false)?;
        return Ok(PayloadOutcome::Overflow { size });
    }
    let len = size as usize;
    for _ in 0..MAX_READ_ATTEMPTS {
        read_chunked(transport, &mut buf[..len], false)?;
        let mut crc_buf = [0u8; 4];
        read_chunked(transport, &mut crc_buf, false)?;
        let expected = u32::from_le_bytes(crc_buf);
        if payload_crc32(&buf[..len]) == expected {
            transport.pulse_alert_success();
            return Ok(PayloadOutcome::Received { len });
        }
        transport.pulse_alert_error();
    }
    Err(ProtocolError::PayloadCrcMismatch)
}

fn drain_discard<T: Transport + ?Sized>(transport: &mut T, size: u32) -> Result<(), ProtocolError> {
    let mut scratch = vec![0u8; MAX_SPI_CHUNK.min(size as usize).max(1)];
    let mut remaining = size as usize;
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        read_chunked(transport, &mut scratch[..chunk], true)?;
        remaining -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_spi_transport::{MockTransport, ScriptedExchange};

    #[test]
    fn header_exchange_succeeds_on_accepted_transaction() {
        let mut t = MockTransport::new(ScriptedExchange::accepted());
        let out = Header::outgoing(1, 0, false);
        let resp = header_exchange(&mut t, out).unwrap();
        assert!(resp.ack());
    }

    #[test]
    fn header_exchange_reports_unsupported() {
        let mut t = MockTransport::new(ScriptedExchange::rejected());
        let out = Header::outgoing(1, 0, false);
        let err = header_exchange(&mut t, out).unwrap_err();
        assert!(matches!(err, ProtocolError::NotSupported));
    }

    #[test]
    fn send_and_receive_payload_round_trips() {
        let mut t = MockTransport::new(ScriptedExchange::with_response(vec![9, 8, 7]));
        let out = Header::outgoing(2, 4, true);
        let ack = header_exchange(&mut t, out).unwrap();
        assert!(ack.ack());
        let final_header = send_payload(&mut t, &[1, 2, 3, 4]).unwrap();
        assert!(final_header.complete());
        assert!(final_header.has_data());

        let mut dest = [0u8; 16];
        match receive_payload(&mut t, &mut dest, 16, final_header.size).unwrap() {
            PayloadOutcome::Received { len } => assert_eq!(&dest[..len], &[9, 8, 7]),
            PayloadOutcome::Overflow { .. } => panic!("unexpected overflow"),
        }
    }

    #[test]
    fn oversized_response_reports_overflow() {
        let mut t = MockTransport::new(ScriptedExchange::with_response(vec![0xEE; 128]));
        let out = Header::outgoing(3, 4, true);
        header_exchange(&mut t, out).unwrap();
        let final_header = send_payload(&mut t, &[1, 2, 3, 4]).unwrap();

        let mut dest = [0u8; 64];
        match receive_payload(&mut t, &mut dest, 64, final_header.size).unwrap() {
            PayloadOutcome::Overflow { size } => assert_eq!(size, 128),
            PayloadOutcome::Received { .. } => panic!("expected overflow"),
        }
    }

    #[test]
    fn rejects_unsupported_even_without_ack() {
        let mut exchange = ScriptedExchange::rejected();
        exchange.ack = false;
        let mut t = MockTransport::new(exchange);
        let out = Header::outgoing(4, 0, false);
        let err = header_exchange(&mut t, out).unwrap_err();
        assert!(matches!(err, ProtocolError::NotSupported));
    }

    #[test]
    fn persistent_nack_exhausts_write_attempts_with_nack_error() {
        let mut t = MockTransport::new(ScriptedExchange::nacked());
        let out = Header::outgoing(5, 0, false);
        let err = header_exchange(&mut t, out).unwrap_err();
        assert!(matches!(err, ProtocolError::Nack));
        assert!(err.is_fatal());
    }
}
