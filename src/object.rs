//! # Object Tree
//!
//! User-installed handlers for incoming method calls, keyed by object path.
//! A node carries plain callbacks (run for every call on the path),
//! interface vtables binding members to handlers and exposing readable
//! properties, and enumerator hooks that contribute child paths to
//! [`Connection::object_paths`].
//!
//! [`Connection::object_paths`]: crate::Connection::object_paths

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::connection::Connection;
use crate::error::Result;
use crate::filter::MessageHandler;

/// Produces the value of a readable property as a string.
pub type PropertyGetter = Rc<RefCell<dyn FnMut(&mut Connection) -> Result<String>>>;

/// Lists child paths below a node, for consumers that walk the tree.
pub type Enumerator = Rc<RefCell<dyn FnMut(&mut Connection) -> Result<Vec<String>>>>;

/// Declarative binding of an interface's members to local handlers.
pub struct Vtable {
    pub interface: String,
    pub methods: Vec<(String, MessageHandler)>,
    pub properties: Vec<(String, PropertyGetter)>,
}

impl Vtable {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn method<F>(mut self, member: &str, f: F) -> Self
    where
        F: FnMut(&mut Connection, &crate::message::Message) -> Result<crate::filter::Handled>
            + 'static,
    {
        self.methods
            .push((member.to_owned(), crate::filter::handler(f)));
        self
    }

    pub fn property<F>(mut self, name: &str, f: F) -> Self
    where
        F: FnMut(&mut Connection) -> Result<String> + 'static,
    {
        self.properties
            .push((name.to_owned(), Rc::new(RefCell::new(f))));
        self
    }
}

/// Handle for removing an object registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u64);

#[derive(Default)]
struct ObjectNode {
    callbacks: Vec<(ObjectId, MessageHandler)>,
    vtables: Vec<(ObjectId, Rc<Vtable>)>,
    enumerators: Vec<(ObjectId, Enumerator)>,
}

impl ObjectNode {
    fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.vtables.is_empty() && self.enumerators.is_empty()
    }
}

/// Everything registered at one path, snapshotted for dispatch.
pub(crate) struct NodeSnapshot {
    pub callbacks: Vec<(ObjectId, MessageHandler)>,
    pub vtables: Vec<Rc<Vtable>>,
}

/// Path-keyed registry of object nodes.
#[derive(Default)]
pub struct ObjectTree {
    nodes: HashMap<String, ObjectNode>,
    next_id: u64,
}

impl ObjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn next_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }

    pub fn add_callback(&mut self, path: &str, handler: MessageHandler) -> ObjectId {
        let id = self.next_id();
        self.nodes
            .entry(path.to_owned())
            .or_default()
            .callbacks
            .push((id, handler));
        id
    }

    pub fn add_vtable(&mut self, path: &str, vtable: Vtable) -> ObjectId {
        let id = self.next_id();
        self.nodes
            .entry(path.to_owned())
            .or_default()
            .vtables
            .push((id, Rc::new(vtable)));
        id
    }

    pub fn add_enumerator(&mut self, path: &str, enumerator: Enumerator) -> ObjectId {
        let id = self.next_id();
        self.nodes
            .entry(path.to_owned())
            .or_default()
            .enumerators
            .push((id, enumerator));
        id
    }

    pub fn remove(&mut self, id: ObjectId) -> bool {
        let mut removed = false;
        self.nodes.retain(|_, node| {
            node.callbacks.retain(|(i, _)| {
                removed |= *i == id;
                *i != id
            });
            node.vtables.retain(|(i, _)| {
                removed |= *i == id;
                *i != id
            });
            node.enumerators.retain(|(i, _)| {
                removed |= *i == id;
                *i != id
            });
            !node.is_empty()
        });
        removed
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<NodeSnapshot> {
        let node = self.nodes.get(path)?;
        Some(NodeSnapshot {
            callbacks: node
                .callbacks
                .iter()
                .map(|(id, h)| (*id, h.clone()))
                .collect(),
            vtables: node.vtables.iter().map(|(_, v)| v.clone()).collect(),
        })
    }

    /// All paths with registrations, without enumerated children.
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.nodes.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Enumerator hooks of every node, for child-path discovery.
    pub(crate) fn enumerators(&self) -> Vec<Enumerator> {
        self.nodes
            .values()
            .flat_map(|n| n.enumerators.iter().map(|(_, e)| e.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
