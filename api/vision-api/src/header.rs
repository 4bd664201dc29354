//! The user-facing header carried alongside every submit: the flags,
//! timeout, buffer sizing, and payload length a caller sets going in and
//! reads back once the transaction completes. Host-side analogue of the
//! original driver's packed `usr_hdr` ioctl argument.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UserFlags: u32 {
        /// Input: don't wait for a response, just for the device's ack.
        const ONEWAY   = 0b0000_0001;
        /// Output: the device acknowledged the request.
        const ACKED    = 0b0000_0010;
        /// Output: a response payload was received and copied back.
        const RESPONSE = 0b0000_0100;
        /// Output: the transaction failed; see the other bits for why.
        const ERROR    = 0b0000_1000;
        /// Output: the caller's wait, or the device's boot, timed out.
        const TIMEOUT  = 0b0001_0000;
        /// Output: the response exceeded the caller's buffer and was
        /// drained and discarded.
        const OVERFLOW = 0b0010_0000;
    }
}

/// Mirrors the original driver's 32-bit `usr_hdr`: `flags` carries
/// [`UserFlags::ONEWAY`] on input and the rest on output; `timeout_ms`
/// bounds the wait; `buffer_len_or_pgoff` is either the caller's buffer
/// capacity (inline submit) or the page-offset key of a previously
/// mmap-ed buffer (mmap submit); `payload_len` is the request size going
/// in and the response size coming back.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserHeader {
    pub flags: UserFlags,
    pub timeout_ms: u32,
    pub buffer_len_or_pgoff: u32,
    pub payload_len: u32,
}

impl UserHeader {
    pub fn oneway(&self) -> bool {
        self.flags.contains(UserFlags::ONEWAY)
    }

    /// Reset the output bits and payload length ahead of a fresh submit,
    /// preserving whatever the caller set on input (`ONEWAY`, the timeout,
    /// the buffer size).
    fn clear_outcome(&mut self) {
        self.flags &= UserFlags::ONEWAY;
        self.payload_len = 0;
    }

    /// Record a successful exchange: `ACKED` always, `RESPONSE` and the
    /// final length only if a response actually came back.
    pub(crate) fn record_success(&mut self, response_len: usize) {
        self.clear_outcome();
        self.flags |= UserFlags::ACKED;
        if response_len > 0 {
            self.flags |= UserFlags::RESPONSE;
            self.payload_len = response_len as u32;
        }
    }

    /// Record a failed exchange. Per the original driver's cancelled-path
    /// behavior, a failure always reports `payload_len = 0` regardless of
    /// what (if anything) the device had written back.
    pub(crate) fn record_failure(&mut self, extra: UserFlags) {
        self.clear_outcome();
        self.flags |= UserFlags::ERROR | extra;
        self.payload_len = 0;
    }
}
