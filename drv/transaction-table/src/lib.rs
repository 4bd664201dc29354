//! The fixed-size table of in-flight transactions shared between a device's
//! submitting threads and its single worker thread.
//!
//! Every transaction lives in exactly one of 16 slots for its whole
//! lifetime; a slot is identified by its 1-based transaction id (0 is
//! reserved for polls and never allocated). Each slot has its own mutex so
//! unrelated transactions don't contend with each other, and the table
//! keeps one [`Condvar`] shared across all of them, mirroring the single
//! waitqueue the original driver used: a submitter waits on its own slot's
//! flags, a worker's `set_flags` wakes everyone, and whoever actually
//! matches the predicate they're waiting on proceeds.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bitflags::bitflags;

/// Number of transaction slots. Mirrors the original driver's fixed table;
/// a 17th concurrent transaction simply blocks in `alloc` until one frees.
pub const SLOT_COUNT: usize = 16;

/// Buffers are never allocated smaller than one SPI chunk, so that even a
/// caller who requested a tiny buffer can still receive a full in-place
/// drain chunk without a second allocation. Mirrors
/// `drv_spi_transport::MAX_SPI_CHUNK`.
const MIN_BUFFER_CAPACITY: usize = 4095;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u8 {
        const ACKED    = 0b0000_0001;
        const RESPONSE = 0b0000_0010;
        const ERROR    = 0b0000_0100;
        const TIMEOUT  = 0b0000_1000;
        const OVERFLOW = 0b0001_0000;
    }
}

impl TransactionFlags {
    /// Flags that mean "stop waiting, something final happened" regardless
    /// of what the waiter actually asked for.
    pub const TERMINAL: TransactionFlags =
        TransactionFlags::ERROR.union(TransactionFlags::TIMEOUT);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Free,
    Incoming,
    /// `next_incoming` has handed this slot to the worker and it is
    /// mid-exchange: the header/payload round trip is running with no
    /// table lock held across the blocking SPI I/O. Mirrors the original
    /// driver dequeuing (`list_del`) a transaction under its own lock
    /// before starting the exchange — a slot in this state is invisible
    /// to `cancel_all`, the same way `Done` is, so a reset racing with an
    /// in-flight dispatch can never free the slot out from under the
    /// worker and hand the same `tid` to an unrelated new transaction.
    Dispatching,
    Ongoing,
    /// The worker has finished exchanging this transaction (successfully or
    /// not) but it is still referenced (the submitter hasn't woken up and
    /// unref'd it yet). No longer a candidate for dispatch or polling, and
    /// no longer touched by `cancel_all` — it isn't "in flight" anymore.
    Done,
}

pub struct TransactionSlot {
    membership: Membership,
    refcount: u32,
    /// User-requested capacity. Used for overflow comparisons and reported
    /// back to the caller; the backing buffer itself is never smaller than
    /// `MIN_BUFFER_CAPACITY` regardless of this value.
    pub capacity: usize,
    /// Length of the most recent payload written into `buffer`: the
    /// request while the transaction is outbound, the response once
    /// `RESPONSE` is set.
    pub payload_len: usize,
    pub flags: TransactionFlags,
    buffer: Vec<u8>,
}

impl TransactionSlot {
    fn new() -> Self {
        Self {
            membership: Membership::Free,
            refcount: 0,
            capacity: 0,
            payload_len: 0,
            flags: TransactionFlags::empty(),
            buffer: Vec::new(),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    /// Overwrite the slot's payload with `data` (must fit within the
    /// backing buffer, i.e. `data.len() <= capacity`) and record its
    /// length. Used both to stage an outgoing request and, later, to copy
    /// in a response.
    fn set_payload(&mut self, data: &[u8]) {
        self.buffer[..data.len()].copy_from_slice(data);
        self.payload_len = data.len();
    }
}

pub enum WaitOutcome {
    /// The waited-for flags (or a terminal flag) are set.
    Ready(TransactionFlags),
    TimedOut,
    /// The caller's cancellation token was observed set before either of
    /// the above. Stands in for a POSIX signal interrupting the original
    /// driver's blocking wait.
    Cancelled,
}

pub struct TransactionTable {
    slots: Vec<Mutex<TransactionSlot>>,
    condvar: Condvar,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(|_| Mutex::new(TransactionSlot::new())).collect(),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self, tid: u8) -> MutexGuard<'_, TransactionSlot> {
        self.slots[(tid - 1) as usize].lock().unwrap()
    }

    /// Claim a free slot for a new transaction, sized to hold at least
    /// `capacity` bytes (and at least `MIN_BUFFER_CAPACITY` regardless).
    /// Returns `None` if all 16 slots are occupied.
    pub fn alloc(&self, capacity: usize) -> Option<u8> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut slot = slot.lock().unwrap();
            if slot.membership == Membership::Free {
                slot.membership = Membership::Incoming;
                slot.refcount = 1;
                slot.capacity = capacity;
                slot.payload_len = 0;
                slot.flags = TransactionFlags::empty();
                slot.buffer.clear();
                slot.buffer.resize(capacity.max(MIN_BUFFER_CAPACITY), 0);
                return Some((idx + 1) as u8);
            }
        }
        None
    }

    pub fn with_slot<R>(&self, tid: u8, f: impl FnOnce(&mut TransactionSlot) -> R) -> R {
        let mut slot = self.lock(tid);
        f(&mut slot)
    }

    /// The capacity the caller requested when allocating `tid`. Determines
    /// the overflow threshold for the response the device sends back.
    pub fn capacity_of(&self, tid: u8) -> usize {
        self.lock(tid).capacity
    }

    /// Clone the transaction's current payload bytes out of the slot. Used
    /// to stage the outgoing request for the SPI write, which must happen
    /// without holding the slot mutex across the (blocking) I/O.
    pub fn read_payload(&self, tid: u8) -> Vec<u8> {
        let slot = self.lock(tid);
        slot.buffer[..slot.payload_len].to_vec()
    }

    /// Overwrite the transaction's payload (request or response) with
    /// `data`.
    pub fn set_payload(&self, tid: u8, data: &[u8]) {
        self.lock(tid).set_payload(data);
    }

    pub fn mark_ongoing(&self, tid: u8) {
        let mut slot = self.lock(tid);
        slot.membership = Membership::Ongoing;
    }

    /// Move `tid` out of dispatch/poll consideration once the worker has
    /// finished exchanging it, successfully or not. Does not touch
    /// refcount; the slot still needs its final `unref` once both the
    /// worker and the waiting submitter are done with it.
    pub fn mark_done(&self, tid: u8) {
        let mut slot = self.lock(tid);
        slot.membership = Membership::Done;
    }

    /// Whether `tid` is currently a live member of the ongoing list. Used
    /// to detect a transaction id the device reports on a poll that the
    /// engine isn't actually tracking — a fatal condition per the
    /// protocol's dispatcher rules.
    pub fn is_ongoing(&self, tid: u8) -> bool {
        tid != 0 && (tid as usize) <= SLOT_COUNT && self.lock(tid).membership == Membership::Ongoing
    }

    /// Whether any slot is currently on the ongoing (polled) list.
    pub fn has_ongoing(&self) -> bool {
        self.slots.iter().any(|s| s.lock().unwrap().membership == Membership::Ongoing)
    }

    pub fn set_flags(&self, tid: u8, flags: TransactionFlags) {
        let mut slot = self.lock(tid);
        slot.flags |= flags;
        drop(slot);
        self.condvar.notify_all();
    }

    pub fn ref_slot(&self, tid: u8) {
        let mut slot = self.lock(tid);
        slot.refcount += 1;
    }

    /// Drop a reference. Once the last reference (submitter and worker both
    /// done with it) goes away, the slot returns to `Free` and any blocked
    /// `alloc` callers are woken.
    pub fn unref(&self, tid: u8) {
        let mut slot = self.lock(tid);
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount == 0 {
            *slot = TransactionSlot::new();
            drop(slot);
            self.condvar.notify_all();
        }
    }

    /// Block until `required` flags are set on `tid`, a terminal flag
    /// (`ERROR`/`TIMEOUT`) is set, or `timeout` elapses. Equivalent to
    /// [`Self::wait_flags_cancellable`] with a cancellation token that is
    /// never set.
    pub fn wait_flags(&self, tid: u8, required: TransactionFlags, timeout: Duration) -> WaitOutcome {
        self.wait_flags_cancellable(tid, required, timeout, &std::sync::atomic::AtomicBool::new(false))
    }

    /// As [`Self::wait_flags`], but also wakes early (returning
    /// [`WaitOutcome::Cancelled`]) once `cancel` is observed set. This is
    /// the host-process stand-in for a blocking syscall interrupted by a
    /// signal: the caller flips `cancel` from another thread and this
    /// wakes within one polling tick instead of running out the timeout.
    pub fn wait_flags_cancellable(
        &self,
        tid: u8,
        required: TransactionFlags,
        timeout: Duration,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> WaitOutcome {
        use std::sync::atomic::Ordering;

        const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

        let deadline = Instant::now() + timeout;
        let mut slot = self.lock(tid);
        loop {
            if slot.flags.contains(required) || slot.flags.intersects(TransactionFlags::TERMINAL) {
                return WaitOutcome::Ready(slot.flags);
            }
            if cancel.load(Ordering::Relaxed) {
                return WaitOutcome::Cancelled;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return WaitOutcome::TimedOut,
            };
            let step = remaining.min(CANCEL_POLL_INTERVAL);
            let (guard, _result) = self.condvar.wait_timeout(slot, step).unwrap();
            slot = guard;
            if slot.flags.contains(required) || slot.flags.intersects(TransactionFlags::TERMINAL) {
                return WaitOutcome::Ready(slot.flags);
            }
            if cancel.load(Ordering::Relaxed) {
                return WaitOutcome::Cancelled;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// The lowest-numbered transaction id still waiting to be dispatched, if
    /// any. The worker always drains these before touching `ongoing` ones.
    ///
    /// Pops the slot out of `Incoming` and into `Dispatching` atomically,
    /// under the same lock acquisition that finds it, so the slot is never
    /// observable as `Incoming` once this returns. The caller is about to
    /// run the blocking header/payload exchange with no table lock held;
    /// without this, `cancel_all` could free the slot mid-exchange and hand
    /// the same id to a brand new transaction.
    pub fn next_incoming(&self) -> Option<u8> {
        for (idx, slot_mutex) in self.slots.iter().enumerate() {
            let mut slot = slot_mutex.lock().unwrap();
            if slot.membership == Membership::Incoming {
                slot.membership = Membership::Dispatching;
                return Some((idx + 1) as u8);
            }
        }
        None
    }

    /// Force every transaction still on the incoming queue or ongoing list
    /// into a terminal error state, drop the reference its list membership
    /// was holding, and wake all waiters. Used when the device is reset:
    /// every transaction still in flight is abandoned, successful or not.
    /// A transaction the worker has already finished (`Membership::Done`)
    /// is left alone — it isn't in flight anymore, and a racing reset
    /// shouldn't clobber a result the submitter hasn't collected yet.
    /// Likewise, a transaction the worker has already popped off the
    /// incoming queue and is actively exchanging (`Membership::Dispatching`)
    /// is left alone: it's mid-I/O with no table lock held, and freeing its
    /// slot here would let a concurrent `alloc` hand the same id to an
    /// unrelated transaction before the stale exchange completes. A slot
    /// whose submitter has already given up (refcount was already down to
    /// the list's own reference) is freed outright; otherwise it's left for
    /// the submitter's own `unref` to finish reclaiming once it notices the
    /// error flag.
    pub fn cancel_all(&self) {
        for slot_mutex in &self.slots {
            let mut slot = slot_mutex.lock().unwrap();
            if !matches!(slot.membership, Membership::Incoming | Membership::Ongoing) {
                continue;
            }
            slot.payload_len = 0;
            slot.flags |= TransactionFlags::ERROR;
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount == 0 {
                *slot = TransactionSlot::new();
            }
        }
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_distinct_ids_and_exhausts() {
        let table = TransactionTable::new();
        let mut ids = Vec::new();
        for _ in 0..SLOT_COUNT {
            ids.push(table.alloc(16).expect("slot available"));
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), SLOT_COUNT);
        assert!(table.alloc(16).is_none());
    }

    #[test]
    fn unref_to_zero_frees_the_slot() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        table.unref(tid);
        assert!(table.alloc(8).is_some());
    }

    #[test]
    fn wait_flags_wakes_on_set_flags() {
        let table = std::sync::Arc::new(TransactionTable::new());
        let tid = table.alloc(8).unwrap();
        let t2 = std::sync::Arc::clone(&table);
        let handle = std::thread::spawn(move || {
            t2.set_flags(tid, TransactionFlags::ACKED);
        });
        let outcome = table.wait_flags(tid, TransactionFlags::ACKED, Duration::from_secs(1));
        handle.join().unwrap();
        assert!(matches!(outcome, WaitOutcome::Ready(f) if f.contains(TransactionFlags::ACKED)));
    }

    #[test]
    fn wait_flags_times_out_without_progress() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        let outcome = table.wait_flags(tid, TransactionFlags::RESPONSE, Duration::from_millis(20));
        assert!(matches!(outcome, WaitOutcome::TimedOut));
    }

    #[test]
    fn cancel_all_wakes_waiters_as_error() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        // Mirrors `submit`'s extra reference for incoming-queue membership;
        // without it cancel_all's refcount drop would free the slot
        // outright instead of leaving it for the "waiter" to observe.
        table.ref_slot(tid);
        table.cancel_all();
        let outcome = table.wait_flags(tid, TransactionFlags::RESPONSE, Duration::from_millis(20));
        assert!(matches!(outcome, WaitOutcome::Ready(f) if f.contains(TransactionFlags::ERROR)));
    }

    #[test]
    fn cancel_all_leaves_a_done_transaction_alone() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        table.ref_slot(tid);
        table.set_flags(tid, TransactionFlags::RESPONSE);
        table.mark_done(tid);
        table.unref(tid); // worker's own reference
        table.cancel_all();
        let outcome = table.wait_flags(tid, TransactionFlags::RESPONSE, Duration::from_millis(20));
        assert!(matches!(outcome, WaitOutcome::Ready(f) if !f.contains(TransactionFlags::ERROR)));
    }

    #[test]
    fn cancel_all_frees_a_slot_with_no_remaining_waiter() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        table.cancel_all();
        // The only reference was the submitter's own; cancelling it with
        // no separate list reference held frees the slot immediately.
        assert_eq!(table.alloc(8), Some(tid));
    }

    #[test]
    fn incoming_drained_before_becoming_ongoing() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        assert_eq!(table.next_incoming(), Some(tid));
        table.mark_ongoing(tid);
        assert_eq!(table.next_incoming(), None);
        assert!(table.is_ongoing(tid));
        assert!(table.has_ongoing());
    }

    #[test]
    fn cancel_all_leaves_a_dispatching_transaction_alone() {
        let table = TransactionTable::new();
        let tid = table.alloc(8).unwrap();
        // Mirrors the worker's own extra reference for incoming-queue
        // membership, same as cancel_all_wakes_waiters_as_error.
        table.ref_slot(tid);
        assert_eq!(table.next_incoming(), Some(tid));
        // The slot is now mid-exchange (Dispatching), as if the worker were
        // blocked in the SPI round trip. A concurrent reset must not be
        // able to observe or free it.
        table.cancel_all();
        assert!(!table.lock(tid).flags.contains(TransactionFlags::ERROR));
        // The worker eventually finishes its exchange and transitions the
        // slot normally, unaffected by the reset that raced it.
        table.mark_ongoing(tid);
        assert!(table.is_ongoing(tid));
    }

    #[test]
    fn wait_flags_cancellable_wakes_on_cancel_token() {
        let table = std::sync::Arc::new(TransactionTable::new());
        let tid = table.alloc(8).unwrap();
        let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let c2 = std::sync::Arc::clone(&cancel);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            c2.store(true, std::sync::atomic::Ordering::Relaxed);
        });
        let outcome = table.wait_flags_cancellable(
            tid,
            TransactionFlags::RESPONSE,
            Duration::from_secs(5),
            &cancel,
        );
        handle.join().unwrap();
        assert!(matches!(outcome, WaitOutcome::Cancelled));
    }
}
