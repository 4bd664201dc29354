//! In-memory stand-in for the other end of the SPI link, used by
//! `drv-vision-protocol` and `task-vision-engine` tests so the whole engine
//! can be exercised without real hardware.
//!
//! `MockTransport` understands just enough of the wire header format to play
//! slave: it does not reuse `drv-vision-protocol`'s codec (that would let a
//! bug in the codec hide itself from its own tests), it has its own small
//! copy, the way a real counterpart device would.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM, CRC_32_ISO_HDLC};
use trace_log::TraceLog;

use crate::{Transport, TransportError, TransportEvent};

const HEADER_LEN: usize = 8;
const FLAG_ACK: u8 = 0b0000_0001;
const FLAG_IS_SUPPORTED: u8 = 0b0000_0010;
const FLAG_TID_VALID: u8 = 0b0000_0100;
const FLAG_HAS_DATA: u8 = 0b0000_1000;
const FLAG_IS_MASTER: u8 = 0b0001_0000;
const FLAG_COMPLETE: u8 = 0b0010_0000;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Scripts the behavior of the simulated slave for a single in-flight
/// transaction. Tests build one of these per scenario and hand it to
/// [`MockTransport::new`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedExchange {
    /// Number of times the header-exchange read returns a header with a
    /// deliberately wrong CRC-16 before returning a valid one. Models a
    /// noisy link that recovers within the retry budget.
    pub header_crc_corruptions: u32,
    /// Whether the slave reports the transaction type as supported at all.
    /// `false` models a `NotSupported` rejection: the header never carries
    /// `IS_SUPPORTED` or `ACK`, terminal on the very first read.
    pub supported: bool,
    /// Whether the slave ever ACKs this transaction id, given it reports
    /// the type as supported. `false` models a persistent nack: the header
    /// carries `IS_SUPPORTED` but never `ACK`, exhausting the write-retry
    /// budget.
    pub ack: bool,
    /// Whether the ack-after-payload header reports the transaction as
    /// complete right away. `false` defers completion to a later poll.
    pub complete_immediately: bool,
    /// Number of polls (after the deferred ack) before the slave reports
    /// completion on a poll response.
    pub defer_polls: u32,
    /// Response payload bytes, if the slave has data to return once
    /// complete. `None` means a write-only (no response data) transaction.
    pub response: Option<Vec<u8>>,
}

impl ScriptedExchange {
    pub fn accepted() -> Self {
        Self {
            supported: true,
            ack: true,
            complete_immediately: true,
            ..Default::default()
        }
    }

    pub fn with_response(data: impl Into<Vec<u8>>) -> Self {
        Self {
            supported: true,
            ack: true,
            complete_immediately: true,
            response: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn deferred(defer_polls: u32) -> Self {
        Self {
            supported: true,
            ack: true,
            complete_immediately: false,
            defer_polls,
            ..Default::default()
        }
    }

    /// Models a `NotSupported` rejection: the slave never even reports the
    /// transaction type as supported.
    pub fn rejected() -> Self {
        Self {
            supported: false,
            ack: false,
            ..Default::default()
        }
    }

    /// Models a persistent nack: the slave supports the transaction type
    /// but never acks it, exhausting the write-retry budget.
    pub fn nacked() -> Self {
        Self {
            supported: true,
            ack: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Header,
    Payload(usize),
    PayloadCrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingHeaderExchangeAck,
    AwaitingSendAck,
}

/// Whether the slave-ready line ever comes up, for the fatal/no-boot
/// scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyPolicy {
    Always,
    Never,
}

pub struct MockTransport {
    events: Arc<TraceLog<TransportEvent>>,
    ready: ReadyPolicy,
    in_boot_mode: bool,
    firmware_out: Vec<u8>,

    expect: Expect,
    scratch: Vec<u8>,
    phase: Phase,

    exchange: ScriptedExchange,
    header_crc_corrupt_remaining: u32,
    last_tid: u8,
    deferred_tid: Option<u8>,
    poll_count: u32,

    payload_out: VecDeque<u8>,
    payload_crc_out: Option<[u8; 4]>,
}

impl MockTransport {
    pub fn new(exchange: ScriptedExchange) -> Self {
        let header_crc_corrupt_remaining = exchange.header_crc_corruptions;
        Self {
            events: Arc::new(TraceLog::new(256)),
            ready: ReadyPolicy::Always,
            in_boot_mode: false,
            firmware_out: Vec::new(),
            expect: Expect::Header,
            scratch: Vec::with_capacity(HEADER_LEN),
            phase: Phase::Idle,
            exchange,
            header_crc_corrupt_remaining,
            last_tid: 0,
            deferred_tid: None,
            poll_count: 0,
            payload_out: VecDeque::new(),
            payload_crc_out: None,
        }
    }

    pub fn with_ready_policy(mut self, ready: ReadyPolicy) -> Self {
        self.ready = ready;
        self
    }

    /// Shared handle to the event trace, for assertions from the test.
    pub fn events(&self) -> Arc<TraceLog<TransportEvent>> {
        Arc::clone(&self.events)
    }

    /// Firmware bytes streamed so far, for boot-sequence assertions.
    pub fn firmware(&self) -> &[u8] {
        &self.firmware_out
    }

    fn header_bytes(flags: u8, tid: u8, size: u32, corrupt: bool) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = flags;
        buf[1] = tid;
        buf[4..8].copy_from_slice(&size.to_le_bytes());
        let mut digest = CRC16.digest();
        digest.update(&[buf[0], buf[1]]);
        digest.update(&buf[4..8]);
        let mut crc = digest.finalize();
        if corrupt {
            crc ^= 0xFFFF;
        }
        buf[2..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn handle_header_write(&mut self, bytes: &[u8]) {
        let tid = bytes[1];
        let size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if tid == 0 {
            self.poll_count += 1;
            self.phase = Phase::Idle;
            self.expect = Expect::Header;
            return;
        }
        self.last_tid = tid;
        self.phase = Phase::AwaitingHeaderExchangeAck;
        if self.header_crc_corrupt_remaining == 0 {
            self.expect = Expect::Payload(size as usize);
        } else {
            // Retried read of the same header: stay put.
            self.expect = Expect::Header;
        }
    }

    fn handle_payload_write(&mut self) {
        self.expect = Expect::PayloadCrc;
    }

    fn handle_payload_crc_write(&mut self) {
        self.phase = Phase::AwaitingSendAck;
        self.expect = Expect::Header;
    }

    fn synthesize_header(&mut self) -> [u8; HEADER_LEN] {
        match self.phase {
            Phase::Idle => self.synthesize_poll_response(),
            Phase::AwaitingHeaderExchangeAck => {
                if self.header_crc_corrupt_remaining > 0 {
                    self.header_crc_corrupt_remaining -= 1;
                    self.events.record(TransportEvent::Read {
                        len: HEADER_LEN,
                        in_place: false,
                    });
                    return Self::header_bytes(0, self.last_tid, 0, true);
                }
                self.synthesize_final_header()
            }
            Phase::AwaitingSendAck => self.synthesize_final_header(),
        }
    }

    fn synthesize_final_header(&mut self) -> [u8; HEADER_LEN] {
        let mut flags = FLAG_TID_VALID;
        if !self.exchange.supported {
            return Self::header_bytes(flags, self.last_tid, 0, false);
        }
        flags |= FLAG_IS_SUPPORTED;
        if self.exchange.ack {
            flags |= FLAG_ACK;
        } else {
            return Self::header_bytes(flags, self.last_tid, 0, false);
        }
        if self.exchange.complete_immediately {
            flags |= FLAG_COMPLETE;
            let size = if let Some(data) = &self.exchange.response {
                flags |= FLAG_HAS_DATA;
                self.queue_response(data);
                data.len() as u32
            } else {
                0
            };
            Self::header_bytes(flags, self.last_tid, size, false)
        } else {
            self.deferred_tid = Some(self.last_tid);
            Self::header_bytes(flags, self.last_tid, 0, false)
        }
    }

    fn synthesize_poll_response(&mut self) -> [u8; HEADER_LEN] {
        let mut flags = FLAG_ACK | FLAG_IS_SUPPORTED | FLAG_TID_VALID;
        let Some(tid) = self.deferred_tid else {
            return Self::header_bytes(flags, 0, 0, false);
        };
        if self.poll_count <= self.exchange.defer_polls {
            return Self::header_bytes(flags, 0, 0, false);
        }
        self.deferred_tid = None;
        flags |= FLAG_COMPLETE;
        let size = if let Some(data) = &self.exchange.response {
            flags |= FLAG_HAS_DATA;
            self.queue_response(data);
            data.len() as u32
        } else {
            0
        };
        Self::header_bytes(flags, tid, size, false)
    }

    fn queue_response(&mut self, data: &[u8]) {
        self.payload_out = data.iter().copied().collect();
        let crc = CRC32.checksum(data);
        self.payload_crc_out = Some(crc.to_le_bytes());
    }
}

impl Transport for MockTransport {
    fn raw_write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.events.record(TransportEvent::Write { len: buf.len() });
        if self.in_boot_mode {
            self.firmware_out.extend_from_slice(buf);
            return Ok(());
        }
        self.scratch.extend_from_slice(buf);
        let target = match self.expect {
            Expect::Header => HEADER_LEN,
            Expect::Payload(n) => n,
            Expect::PayloadCrc => 4,
        };
        if self.scratch.len() < target {
            return Ok(());
        }
        let frame = std::mem::take(&mut self.scratch);
        match self.expect {
            Expect::Header => self.handle_header_write(&frame),
            Expect::Payload(_) => self.handle_payload_write(),
            Expect::PayloadCrc => self.handle_payload_crc_write(),
        }
        Ok(())
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.events.record(TransportEvent::Read {
            len: buf.len(),
            in_place: false,
        });
        if buf.len() == HEADER_LEN {
            let header = self.synthesize_header();
            buf.copy_from_slice(&header);
            return Ok(());
        }
        if buf.len() == 4 && self.payload_out.is_empty() {
            if let Some(crc) = self.payload_crc_out.take() {
                buf.copy_from_slice(&crc);
                return Ok(());
            }
        }
        for b in buf.iter_mut() {
            *b = self.payload_out.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn cs_low(&mut self) {}

    fn cs_high(&mut self) {}

    fn pulse_alert_success(&mut self) {
        self.events.record(TransportEvent::AlertSuccess);
    }

    fn pulse_alert_error(&mut self) {
        self.events.record(TransportEvent::AlertError);
    }

    fn assert_reset(&mut self) {
        self.events.record(TransportEvent::ResetAsserted);
    }

    fn deassert_reset(&mut self) {
        self.events.record(TransportEvent::ResetDeasserted);
    }

    fn set_boot_frequency(&mut self) -> Result<(), TransportError> {
        self.in_boot_mode = true;
        self.events.record(TransportEvent::BootFrequency);
        Ok(())
    }

    fn set_normal_frequency(&mut self) -> Result<(), TransportError> {
        self.in_boot_mode = false;
        self.events.record(TransportEvent::NormalFrequency);
        Ok(())
    }

    fn wait_slave_ready(&mut self, _timeout: Duration) -> bool {
        match self.ready {
            ReadyPolicy::Always => true,
            ReadyPolicy::Never => {
                self.events.record(TransportEvent::SlaveReadyTimeout);
                false
            }
        }
    }

    fn sleep(&mut self, _duration: Duration) {
        // Instantaneous in tests: real delays would make the suite slow
        // without exercising any behavior the mock doesn't already model.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{read_chunked, write_chunked};

    fn header_exchange(t: &mut MockTransport, tid: u8, payload_len: u32) -> [u8; HEADER_LEN] {
        let flags = FLAG_ACK | FLAG_IS_SUPPORTED | FLAG_TID_VALID | FLAG_HAS_DATA | FLAG_IS_MASTER;
        let out = MockTransport::header_bytes(flags, tid, payload_len, false);
        write_chunked(t, &out).unwrap();
        let mut resp = [0u8; HEADER_LEN];
        read_chunked(t, &mut resp, false).unwrap();
        resp
    }

    #[test]
    fn accepts_and_echoes_small_payload() {
        let mut t = MockTransport::new(ScriptedExchange::with_response(vec![0xAAu8; 4]));
        let resp = header_exchange(&mut t, 1, 4);
        assert_ne!(resp[0] & FLAG_ACK, 0);

        write_chunked(&mut t, &[1, 2, 3, 4]).unwrap();
        let crc = CRC32.checksum(&[1, 2, 3, 4]).to_le_bytes();
        write_chunked(&mut t, &crc).unwrap();

        let mut ack = [0u8; HEADER_LEN];
        read_chunked(&mut t, &mut ack, false).unwrap();
        assert_ne!(ack[0] & FLAG_COMPLETE, 0);
        assert_ne!(ack[0] & FLAG_HAS_DATA, 0);
        let size = u32::from_le_bytes(ack[4..8].try_into().unwrap());
        assert_eq!(size, 4);

        let mut data = [0u8; 4];
        read_chunked(&mut t, &mut data, false).unwrap();
        assert_eq!(data, [0xAA; 4]);
    }

    #[test]
    fn header_exchange_recovers_from_crc_corruption() {
        let mut exchange = ScriptedExchange::accepted();
        exchange.header_crc_corruptions = 5;
        let mut t = MockTransport::new(exchange);
        let flags = FLAG_ACK | FLAG_IS_SUPPORTED | FLAG_TID_VALID | FLAG_IS_MASTER;
        let out = MockTransport::header_bytes(flags, 2, 0, false);
        write_chunked(&mut t, &out).unwrap();

        for _ in 0..5 {
            let mut resp = [0u8; HEADER_LEN];
            read_chunked(&mut t, &mut resp, false).unwrap();
            let digest = {
                let mut d = CRC16.digest();
                d.update(&[resp[0], resp[1]]);
                d.update(&resp[4..8]);
                d.finalize()
            };
            let crc = u16::from_le_bytes(resp[2..4].try_into().unwrap());
            assert_ne!(digest, crc, "expected a corrupted header");
        }
        let mut resp = [0u8; HEADER_LEN];
        read_chunked(&mut t, &mut resp, false).unwrap();
        let digest = {
            let mut d = CRC16.digest();
            d.update(&[resp[0], resp[1]]);
            d.update(&resp[4..8]);
            d.finalize()
        };
        let crc = u16::from_le_bytes(resp[2..4].try_into().unwrap());
        assert_eq!(digest, crc);
    }

    #[test]
    fn never_ready_times_out() {
        let mut t =
            MockTransport::new(ScriptedExchange::accepted()).with_ready_policy(ReadyPolicy::Never);
        let err = write_chunked(&mut t, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TransportError::SlaveReadyTimeout(_)));
    }

    #[test]
    fn firmware_bypasses_header_framing() {
        let mut t = MockTransport::new(ScriptedExchange::accepted());
        let fw = vec![0x11u8; 200_000];
        crate::write_firmware_chunked(&mut t, &fw).unwrap();
        assert_eq!(t.firmware(), fw.as_slice());
    }
}
