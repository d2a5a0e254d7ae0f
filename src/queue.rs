//! # Message Queues
//!
//! Bounded outbound and inbound queues. The send queue remembers a partial
//! write of its head message in `windex`, so a short write never loses
//! position; a fully written head is popped and the cursor resets. Pushing
//! past either cap fails with [`Error::OutOfBuffer`] without touching the
//! queue.

use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::message::Message;

/// Maximum number of queued outbound messages.
pub const WQUEUE_MAX: usize = 1024;

/// Maximum number of locally queued inbound messages.
pub const RQUEUE_MAX: usize = 64 * 1024;

/// Outbound queue with partial-write cursor.
#[derive(Default)]
pub struct SendQueue {
    items: VecDeque<Rc<Message>>,
    /// Header+body bytes of the head message already written out.
    windex: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, msg: Rc<Message>) -> Result<()> {
        if self.items.len() >= WQUEUE_MAX {
            return Err(Error::OutOfBuffer);
        }
        self.items.push_back(msg);
        Ok(())
    }

    pub fn head(&self) -> Option<&Rc<Message>> {
        self.items.front()
    }

    /// Bytes of the head message already on the wire.
    pub fn windex(&self) -> usize {
        self.windex
    }

    /// Record `n` more bytes written; pops the head when it completes.
    ///
    /// Returns true if the head message was fully written and dropped.
    pub fn advance(&mut self, n: usize) -> bool {
        let Some(head) = self.items.front() else {
            return false;
        };
        self.windex += n;
        debug_assert!(self.windex <= head.size());
        if self.windex >= head.size() {
            self.items.pop_front();
            self.windex = 0;
            return true;
        }
        false
    }

    /// Remember an already-started head message, e.g. when a direct write
    /// from `send()` came up short.
    pub fn push_front_partial(&mut self, msg: Rc<Message>, written: usize) {
        debug_assert!(self.items.is_empty() && self.windex == 0);
        // One slot is always available, so a partial write can be parked
        // without a fallible allocation.
        self.items.push_front(msg);
        self.windex = written;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.windex = 0;
    }
}

/// Inbound queue of already-parsed messages.
#[derive(Default)]
pub struct RecvQueue {
    items: VecDeque<Message>,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, msg: Message) -> Result<()> {
        if self.items.len() >= RQUEUE_MAX {
            return Err(Error::OutOfBuffer);
        }
        self.items.push_back(msg);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(serial: u32) -> Rc<Message> {
        let mut m = Message::method_call("", "/", "a.b", "M").unwrap();
        m.seal(serial).unwrap();
        Rc::new(m)
    }

    #[test]
    fn partial_writes_accumulate_then_pop() {
        let mut q = SendQueue::new();
        let m = sealed(1);
        let total = m.size();
        q.push(m).unwrap();

        assert!(!q.advance(total / 2));
        assert_eq!(q.windex(), total / 2);
        assert!(q.advance(total - total / 2));
        assert_eq!(q.windex(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn windex_survives_while_later_messages_queue() {
        let mut q = SendQueue::new();
        q.push(sealed(1)).unwrap();
        q.push(sealed(2)).unwrap();
        q.advance(3);
        assert_eq!(q.windex(), 3);
        assert_eq!(q.len(), 2);
        assert_eq!(q.head().unwrap().serial(), Some(1));
    }

    #[test]
    fn send_queue_cap_is_enforced() {
        let mut q = SendQueue::new();
        for i in 0..WQUEUE_MAX {
            q.push(sealed(i as u32 + 1)).unwrap();
        }
        match q.push(sealed(9999)) {
            Err(Error::OutOfBuffer) => {}
            other => panic!("expected OutOfBuffer, got {:?}", other),
        }
        assert_eq!(q.len(), WQUEUE_MAX);
    }

    #[test]
    fn recv_queue_is_fifo() {
        let mut q = RecvQueue::new();
        for serial in [5u32, 6, 7] {
            let mut m = Message::method_call("", "/", "a.b", "M").unwrap();
            m.seal(serial).unwrap();
            q.push(Message::from_wire(m.wire().unwrap().to_vec(), Vec::new()).unwrap())
                .unwrap();
        }
        assert_eq!(q.pop().unwrap().serial(), Some(5));
        assert_eq!(q.pop().unwrap().serial(), Some(6));
        assert_eq!(q.pop().unwrap().serial(), Some(7));
        assert!(q.pop().is_none());
    }
}
