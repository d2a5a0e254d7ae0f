//! # Reply Correlation
//!
//! Outgoing method calls that expect a reply register a [`PendingReply`]
//! keyed by serial. Two structures stay synchronized: the serial map, and a
//! deadline-ordered binary heap used for timeout expiry. Each record stores
//! its current heap index so removal by serial is O(log n); the heap writes
//! the index back on every sift. Records without a deadline never enter the
//! heap.
//!
//! A callback fires at most once across normal delivery, cancellation and
//! timeout expiry: all three paths remove the record before anything runs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::message::Message;

/// Applied when the caller asks for [`Timeout::Default`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Reply deadline selector for method calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Use [`DEFAULT_CALL_TIMEOUT`].
    Default,
    /// Wait forever.
    Never,
    /// Explicit duration from now.
    After(Duration),
}

impl Timeout {
    pub(crate) fn deadline_from(self, now: Instant) -> Option<Instant> {
        match self {
            Timeout::Default => Some(now + DEFAULT_CALL_TIMEOUT),
            Timeout::Never => None,
            Timeout::After(d) => Some(now + d),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::After(d)
    }
}

/// One-shot reply handler. Receives the reply (or the synthesized timeout
/// error); errors bubble out of `process()` unchanged.
pub type ReplyCallback = Box<dyn FnOnce(&mut Connection, &Message) -> Result<()>>;

struct PendingReply {
    callback: ReplyCallback,
    deadline: Option<Instant>,
    /// Position in the timeout heap, when a deadline exists.
    heap_idx: Option<usize>,
}

/// Serial→record map plus the timeout heap.
#[derive(Default)]
pub struct ReplyTracker {
    pending: HashMap<u32, PendingReply>,
    /// Min-heap of serials ordered by deadline. Every member has
    /// `deadline = Some(_)`.
    heap: Vec<u32>,
}

impl ReplyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, serial: u32) -> bool {
        self.pending.contains_key(&serial)
    }

    /// Register a callback for `serial`.
    pub fn register(
        &mut self,
        serial: u32,
        deadline: Option<Instant>,
        callback: ReplyCallback,
    ) -> Result<()> {
        if serial == 0 {
            return Err(Error::invalid("serial must be positive"));
        }
        if self.pending.contains_key(&serial) {
            return Err(Error::invalid(format!(
                "serial {} already has a pending reply",
                serial
            )));
        }

        self.pending.insert(
            serial,
            PendingReply {
                callback,
                deadline,
                heap_idx: None,
            },
        );

        if deadline.is_some() {
            self.heap.push(serial);
            let idx = self.heap.len() - 1;
            self.set_idx(serial, idx);
            self.sift_up(idx);
        }

        Ok(())
    }

    /// Drop the record for `serial`, if any. Idempotent; after this returns
    /// the callback will not fire.
    pub fn cancel(&mut self, serial: u32) -> bool {
        match self.pending.remove(&serial) {
            Some(record) => {
                if let Some(idx) = record.heap_idx {
                    self.remove_at(idx);
                }
                true
            }
            None => false,
        }
    }

    /// Remove and return the callback registered for `serial`.
    pub fn take(&mut self, serial: u32) -> Option<ReplyCallback> {
        let record = self.pending.remove(&serial)?;
        if let Some(idx) = record.heap_idx {
            self.remove_at(idx);
        }
        Some(record.callback)
    }

    /// Earliest deadline across all registered records.
    pub fn next_deadline(&self) -> Option<Instant> {
        let serial = *self.heap.first()?;
        self.pending.get(&serial).and_then(|r| r.deadline)
    }

    /// Pop one record whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Option<(u32, ReplyCallback)> {
        let serial = *self.heap.first()?;
        let deadline = self.pending.get(&serial)?.deadline?;
        if deadline > now {
            return None;
        }
        let callback = self.take(serial)?;
        Some((serial, callback))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.heap.clear();
    }

    fn deadline_at(&self, idx: usize) -> Instant {
        // Heap members always carry a deadline.
        self.pending
            .get(&self.heap[idx])
            .and_then(|r| r.deadline)
            .unwrap_or_else(Instant::now)
    }

    fn set_idx(&mut self, serial: u32, idx: usize) {
        if let Some(r) = self.pending.get_mut(&serial) {
            r.heap_idx = Some(idx);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.set_idx(self.heap[a], a);
        self.set_idx(self.heap[b], b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.deadline_at(idx) >= self.deadline_at(parent) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let mut smallest = idx;
            for child in [2 * idx + 1, 2 * idx + 2] {
                if child < self.heap.len() && self.deadline_at(child) < self.deadline_at(smallest) {
                    smallest = child;
                }
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn remove_at(&mut self, idx: usize) {
        let last = self.heap.len() - 1;
        if idx != last {
            self.swap(idx, last);
        }
        self.heap.pop();
        if idx < self.heap.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    /// Back-index consistency, checked by tests.
    #[cfg(test)]
    fn assert_consistent(&self) {
        for (i, serial) in self.heap.iter().enumerate() {
            let record = self.pending.get(serial).expect("heap entry without record");
            assert_eq!(record.heap_idx, Some(i));
            assert!(record.deadline.is_some());
        }
        for (serial, record) in &self.pending {
            if let Some(idx) = record.heap_idx {
                assert_eq!(self.heap.get(idx), Some(serial));
            }
        }
    }
}
