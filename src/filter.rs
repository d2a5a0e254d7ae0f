//! # Filter Callbacks
//!
//! Filters see every inbound message before match rules and object dispatch.
//! They run in registration order; the first one that reports
//! [`Handled::Yes`] stops the chain for that message.
//!
//! The list may be mutated from inside a running filter. The dispatcher then
//! restarts its scan from the head, and a per-entry iteration stamp makes
//! sure no filter runs twice for the same message.

use std::cell::RefCell;
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;

/// Outcome of a filter, match or object callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Keep dispatching this message.
    No,
    /// The message is consumed; stop the chain.
    Yes,
}

/// Shared message callback. Filters, match rules and object methods all use
/// this shape; the connection hands itself in so the callback can send
/// replies or mutate registrations.
pub type MessageHandler = Rc<RefCell<dyn FnMut(&mut Connection, &Message) -> Result<Handled>>>;

/// Wrap a closure into a [`MessageHandler`].
pub fn handler<F>(f: F) -> MessageHandler
where
    F: FnMut(&mut Connection, &Message) -> Result<Handled> + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Handle returned by [`Connection::add_filter`], used for removal.
///
/// [`Connection::add_filter`]: crate::Connection::add_filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

struct FilterEntry {
    id: FilterId,
    handler: MessageHandler,
    /// Dispatch iteration that last ran this filter.
    last_iteration: u64,
}

/// Ordered filter list with a mutation flag.
#[derive(Default)]
pub struct FilterList {
    entries: Vec<FilterEntry>,
    next_id: u64,
    modified: bool,
}

impl FilterList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest filters run first, so one added mid-dispatch is picked up by
    /// the restarted scan before the already-stamped entries.
    pub fn add(&mut self, handler: MessageHandler) -> FilterId {
        self.next_id += 1;
        let id = FilterId(self.next_id);
        self.entries.insert(
            0,
            FilterEntry {
                id,
                handler,
                last_iteration: 0,
            },
        );
        self.modified = true;
        id
    }

    pub fn remove(&mut self, id: FilterId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.modified = true;
        }
        removed
    }

    /// Entry snapshot for the scan loop: id, handler, last-run stamp.
    pub(crate) fn entry_at(&self, idx: usize) -> Option<(FilterId, MessageHandler, u64)> {
        self.entries
            .get(idx)
            .map(|e| (e.id, e.handler.clone(), e.last_iteration))
    }

    pub(crate) fn stamp(&mut self, id: FilterId, iteration: u64) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.last_iteration = iteration;
        }
    }

    pub(crate) fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.modified = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_flag_modification() {
        let mut list = FilterList::new();
        let id = list.add(handler(|_, _| Ok(Handled::No)));
        assert!(list.take_modified());
        assert!(!list.take_modified());

        assert!(list.remove(id));
        assert!(list.take_modified());
        assert!(!list.remove(id));
        assert!(!list.take_modified());
    }

    #[test]
    fn newest_entry_sits_at_the_head() {
        let mut list = FilterList::new();
        let a = list.add(handler(|_, _| Ok(Handled::No)));
        let b = list.add(handler(|_, _| Ok(Handled::No)));
        assert_eq!(list.entry_at(0).unwrap().0, b);
        assert_eq!(list.entry_at(1).unwrap().0, a);
        assert!(list.entry_at(2).is_none());
    }

    #[test]
    fn stamps_are_per_entry() {
        let mut list = FilterList::new();
        let a = list.add(handler(|_, _| Ok(Handled::No)));
        let b = list.add(handler(|_, _| Ok(Handled::No)));
        list.stamp(a, 4);
        assert_eq!(list.entry_at(1).unwrap().2, 4);
        assert_eq!(list.entry_at(0).unwrap().2, 0);
        list.stamp(b, 5);
        assert_eq!(list.entry_at(0).unwrap().2, 5);
    }
}
