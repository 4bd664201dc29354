//! A small bounded trace buffer for recording protocol events.
//!
//! This is the host-side counterpart of the teacher's `ringbuf` crate:
//! Hubris tasks record entries into a static, debugger-inspectable ring
//! buffer because they have no stdout and no heap-backed logging. A host
//! process has both, so [`TraceLog`] trades the static/no_std machinery for
//! an ordinary `Mutex<VecDeque<T>>` that any number of threads can share via
//! `Arc`, while keeping the same idea: a fixed-capacity, oldest-entry-drops
//! record of what the protocol engine did, cheap enough to leave enabled and
//! easy for tests to snapshot.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct TraceLog<T> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T: Clone> TraceLog<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "trace log capacity must be nonzero");
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record an entry, evicting the oldest one if the log is full.
    pub fn record(&self, entry: T) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Count entries matching a predicate, useful for assertions like
    /// "the master-error line was pulsed 5 times".
    pub fn count(&self, mut pred: impl FnMut(&T) -> bool) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}
