//! The single dedicated thread that serializes every bit of SPI traffic for
//! one [`crate::Device`].
//!
//! The original two self-rescheduling work items (an incoming-worker and
//! an ongoing-worker sharing one work queue) are collapsed here into one
//! loop that pulls from both the incoming queue and the ongoing (polled)
//! list, always draining incoming first and rate-limiting ongoing polls
//! to [`crate::config::DeviceConfig::ongoing_poll_interval`] —
//! semantically the same schedule, simpler to read as a single function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drv_transaction_table::TransactionFlags;
use drv_vision_protocol::{header_exchange, receive_payload, send_payload, Header, PayloadOutcome, ProtocolError};

use crate::device::Device;
use crate::trace::EngineEvent;

/// The two buckets a failed exchange falls into: one that only dooms the
/// transaction at hand, and one that dooms the link itself.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Severity {
    TransactionOnly,
    Fatal,
}

fn severity(e: &ProtocolError) -> Severity {
    if e.is_fatal() {
        Severity::Fatal
    } else {
        Severity::TransactionOnly
    }
}

/// Run until `shutdown` is set. Intended to be the body of the device's
/// one dedicated worker thread; never called concurrently with itself.
pub fn run(device: Arc<Device>, shutdown: Arc<AtomicBool>) {
    let mut next_poll_at = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        if dispatch_one_incoming(&device) {
            continue;
        }
        if device.table.has_ongoing() {
            let now = Instant::now();
            if now >= next_poll_at {
                poll_once(&device);
                next_poll_at = Instant::now() + device.config.ongoing_poll_interval;
            } else {
                // A real wall-clock sleep, deliberately not routed through
                // `Transport::sleep`: that hook exists so tests can make
                // boot/reset delays instantaneous, not so the dispatcher's
                // own idle backoff can be short-circuited along with them.
                std::thread::sleep((next_poll_at - now).min(device.config.idle_poll_interval));
            }
            continue;
        }
        std::thread::sleep(device.config.idle_poll_interval);
    }
}

/// Pop and fully exchange one incoming transaction, if any is queued.
/// Returns whether there was one to run, so the caller can keep draining
/// the incoming queue before ever looking at the ongoing list.
fn dispatch_one_incoming(device: &Arc<Device>) -> bool {
    let Some(tid) = device.table.next_incoming() else {
        return false;
    };
    device.trace.record(EngineEvent::TransactionDispatched { tid });

    let request = device.table.read_payload(tid);
    let outgoing = Header::outgoing(tid, request.len() as u32, true);

    let result = {
        let mut transport = device.transport.lock().unwrap();
        let t = transport.as_mut();
        header_exchange(t, outgoing).and_then(|_accepted| send_payload(t, &request))
    };

    let ack = match result {
        Ok(ack) => ack,
        Err(e) => {
            fail_transaction(device, tid, &e);
            return true;
        }
    };

    device.table.set_flags(tid, TransactionFlags::ACKED);

    if !ack.complete() {
        device.table.mark_ongoing(tid);
        return true;
    }

    if ack.has_data() && ack.size > 0 {
        complete_with_response(device, tid, ack.size);
    } else {
        // Write-only completion: no response payload is ever coming, so a
        // non-one-way submitter is unblocked with an empty response rather
        // than left waiting on a RESPONSE flag that will never arrive. The
        // slot still holds the outgoing request bytes; clear it so the
        // submitter reads back an empty response instead of its own
        // request.
        device.table.set_payload(tid, &[]);
        device.table.set_flags(tid, TransactionFlags::RESPONSE);
        finish(device, tid);
    }
    true
}

/// Run one poll exchange (a header exchange in poll form) and, if the
/// device reports a completed transaction, finish it.
fn poll_once(device: &Arc<Device>) {
    let result = {
        let mut transport = device.transport.lock().unwrap();
        header_exchange(transport.as_mut(), Header::poll())
    };
    device.trace.record(EngineEvent::Poll);

    let response = match result {
        Ok(r) => r,
        Err(e) => {
            // A poll carries no transaction id of its own to blame, so any
            // failure here is attributed to the link as a whole.
            report_fatal(device, &e);
            return;
        }
    };

    if !response.complete() {
        return;
    }
    let tid = response.transaction_id;
    if tid == 0 {
        return;
    }
    if !device.table.is_ongoing(tid) {
        // The device named a transaction we're not tracking: this is
        // fatal regardless of cause.
        log::error!("vision-engine: device reported unknown transaction id {tid} on poll");
        run_fatal_policy(device);
        return;
    }

    if response.has_data() && response.size > 0 {
        complete_with_response(device, tid, response.size);
    } else {
        device.table.set_payload(tid, &[]);
        device.table.set_flags(tid, TransactionFlags::RESPONSE);
        finish(device, tid);
    }
}

/// Run the receive-payload procedure for `tid` against a response of
/// `size` bytes, then finish the transaction one way or the other.
fn complete_with_response(device: &Arc<Device>, tid: u8, size: u32) {
    let capacity = device.table.capacity_of(tid);
    let mut buf = vec![0u8; capacity];
    let result = {
        let mut transport = device.transport.lock().unwrap();
        receive_payload(transport.as_mut(), &mut buf, capacity, size)
    };
    match result {
        Ok(PayloadOutcome::Received { len }) => {
            device.table.set_payload(tid, &buf[..len]);
            device.table.set_flags(tid, TransactionFlags::RESPONSE);
            finish(device, tid);
        }
        Ok(PayloadOutcome::Overflow { .. }) => {
            device.table.set_flags(tid, TransactionFlags::OVERFLOW | TransactionFlags::ERROR);
            finish(device, tid);
        }
        Err(e) => fail_transaction(device, tid, &e),
    }
}

/// Mark `tid` as no longer in flight, drop the worker's own reference, and
/// record the outcome.
fn finish(device: &Arc<Device>, tid: u8) {
    device.table.mark_done(tid);
    device.table.unref(tid);
    device.trace.record(EngineEvent::TransactionCompleted { tid });
}

/// A transaction's exchange failed. Flag it as errored, finish it, and —
/// if the failure was link-level rather than transaction-level — run the
/// fatal-error policy.
fn fail_transaction(device: &Arc<Device>, tid: u8, e: &ProtocolError) {
    device.table.set_flags(tid, TransactionFlags::ERROR);
    device.table.mark_done(tid);
    device.table.unref(tid);
    device.trace.record(EngineEvent::TransactionFailed { tid });
    if severity(e) == Severity::Fatal {
        report_fatal(device, e);
    }
}

/// Cancel every other in-flight transaction and, if configured, reboot the
/// device. The caller's own transaction (if any) has already been flagged
/// and finished separately.
fn report_fatal(device: &Arc<Device>, e: &ProtocolError) {
    log::error!("vision-engine: fatal protocol error: {e}");
    run_fatal_policy(device);
}

/// Cancel every in-flight transaction, always; reboot the device only if
/// `reset_on_failure` is set.
fn run_fatal_policy(device: &Arc<Device>) {
    device.table.cancel_all();
    device.trace.record(EngineEvent::Fatal);
    if !device.config.reset_on_failure {
        return;
    }
    if let Err(e) = device.reboot() {
        log::error!("vision-engine: reboot after fatal error failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use drv_spi_transport::{MockTransport, ScriptedExchange};

    use crate::boot::StaticFirmwareLoader;
    use crate::config::DeviceConfig;
    use crate::device::{Device, ONEWAY};

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            ongoing_poll_interval: Duration::from_millis(1),
            idle_poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn small_echo_round_trips() {
        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::with_response(vec![
                0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE,
            ])));
        let device = Device::open(
            transport,
            Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])),
            test_config(),
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let response = device
            .submit(
                &[0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE],
                8,
                false,
                Duration::from_secs(1),
                &cancel,
            )
            .unwrap();
        assert_eq!(response, vec![0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE]);
    }

    #[test]
    fn oneway_returns_as_soon_as_acked() {
        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::with_response(vec![1, 2, 3])));
        let device = Device::open(
            transport,
            Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])),
            test_config(),
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let response = device
            .submit(&[9u8; 16], 16, true, Duration::from_secs(1), &cancel)
            .unwrap();
        assert!(response.is_empty());
        let _ = ONEWAY;
    }

    #[test]
    fn overflowing_response_fails_with_overflow() {
        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::with_response(vec![0xEE; 128])));
        let device = Device::open(
            transport,
            Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])),
            test_config(),
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let err = device
            .submit(&[1, 2, 3, 4], 64, false, Duration::from_secs(1), &cancel)
            .unwrap_err();
        assert!(matches!(err, crate::error::SubmitError::Overflow));
    }

    #[test]
    fn header_crc_retries_then_succeeds() {
        let mut exchange = ScriptedExchange::accepted();
        exchange.header_crc_corruptions = 5;
        let transport: Box<dyn drv_spi_transport::Transport> = Box::new(MockTransport::new(exchange));
        let device = Device::open(
            transport,
            Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])),
            test_config(),
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let response = device.submit(&[1, 2, 3, 4], 16, false, Duration::from_secs(1), &cancel).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn deferred_response_completes_after_a_poll() {
        let mut exchange = ScriptedExchange::deferred(1);
        exchange.response = Some(vec![7, 7, 7]);
        let transport: Box<dyn drv_spi_transport::Transport> = Box::new(MockTransport::new(exchange));
        let device = Device::open(
            transport,
            Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])),
            test_config(),
        )
        .unwrap();

        let cancel = AtomicBool::new(false);
        let response = device
            .submit(&[1, 2, 3], 16, false, Duration::from_secs(2), &cancel)
            .unwrap();
        assert_eq!(response, vec![7, 7, 7]);
    }

    #[test]
    fn boot_fails_when_slave_ready_never_asserts() {
        use drv_spi_transport::ReadyPolicy;

        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::accepted()).with_ready_policy(ReadyPolicy::Never));
        let device = Device::open(transport, Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])), test_config());
        // Boot itself requires slave-ready; with it never asserting, open()
        // fails before a worker is even spawned -- a cold boot that never
        // completes.
        assert!(matches!(device.unwrap_err(), crate::error::BootError::NoSlaveReady));
    }

    #[test]
    fn crc_retry_exhaustion_fails_the_transaction_and_reboots() {
        let mut exchange = ScriptedExchange::accepted();
        exchange.header_crc_corruptions = 100;
        let mock = MockTransport::new(exchange);
        let events = mock.events();
        let transport: Box<dyn drv_spi_transport::Transport> = Box::new(mock);
        let device = Device::open(transport, Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])), test_config())
            .unwrap();

        let cancel = AtomicBool::new(false);
        let err = device
            .submit(&[1, 2, 3, 4], 16, false, Duration::from_secs(2), &cancel)
            .unwrap_err();
        assert!(matches!(err, crate::error::SubmitError::Failed));

        // The worker's fatal-error handling (cancel_all + reboot) runs
        // synchronously before the next dispatch, but may still be mid-reboot
        // when `submit` wakes on the ERROR flag; give it a moment to finish.
        for _ in 0..200 {
            if events.count(|e| matches!(e, drv_spi_transport::TransportEvent::ResetAsserted)) >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(
            events.count(|e| matches!(e, drv_spi_transport::TransportEvent::AlertError)) >= 100,
            "expected the master-error line pulsed on every corrupted header"
        );
        assert!(
            events.count(|e| matches!(e, drv_spi_transport::TransportEvent::ResetAsserted)) >= 2,
            "expected a reboot beyond the initial boot once reset_on_failure fired"
        );
    }

    #[test]
    fn two_concurrent_submits_both_complete_without_interleaving() {
        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::with_response(vec![1, 2, 3, 4])));
        let device = Device::open(transport, Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])), test_config())
            .unwrap();

        let d1 = std::sync::Arc::clone(&device);
        let d2 = std::sync::Arc::clone(&device);
        let h1 = std::thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            d1.submit(&[1, 1, 1, 1], 16, false, Duration::from_secs(2), &cancel)
        });
        let h2 = std::thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            d2.submit(&[2, 2, 2, 2], 16, false, Duration::from_secs(2), &cancel)
        });

        let r1 = h1.join().unwrap().unwrap();
        let r2 = h2.join().unwrap().unwrap();
        assert_eq!(r1, vec![1, 2, 3, 4]);
        assert_eq!(r2, vec![1, 2, 3, 4]);
    }

    #[test]
    fn cancelling_a_submit_via_timeout_does_not_leak_the_slot() {
        // A response that never arrives (deferred forever) forces the
        // submitter to time out while the worker still believes the
        // transaction is ongoing; once the worker later fails/cancels it,
        // the slot must still become reclaimable.
        let transport: Box<dyn drv_spi_transport::Transport> =
            Box::new(MockTransport::new(ScriptedExchange::deferred(u32::MAX)));
        let device = Device::open(transport, Box::new(StaticFirmwareLoader::new(vec![0xAA; 16])), test_config())
            .unwrap();

        let cancel = AtomicBool::new(false);
        let err = device
            .submit(&[1, 2, 3, 4], 16, false, Duration::from_millis(20), &cancel)
            .unwrap_err();
        assert!(matches!(err, crate::error::SubmitError::Timeout));

        // Reset cancels the still-ongoing transaction and frees its slot;
        // a fresh submit must then succeed rather than report Busy.
        device.reset().unwrap();
        let err2 = device
            .submit(&[9], 16, false, Duration::from_millis(50), &cancel)
            .unwrap_err();
        assert!(!matches!(err2, crate::error::SubmitError::Busy));
    }
}
