//! # Match Rules
//!
//! Match expressions subscribe callbacks to messages by header fields, e.g.
//! `type='signal',interface='org.example.Frob',member='Changed',arg0='x'`.
//! Parsed components live in a tree keyed component-by-component in a fixed
//! order, so rules sharing a prefix share tree nodes; each leaf holds its
//! callbacks together with the cookie used to register the rule with the
//! broker.
//!
//! Like the filter list, the tree carries a mutation flag and per-entry
//! iteration stamps so the dispatcher can restart safely when a callback
//! changes the registrations mid-scan.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::filter::MessageHandler;
use crate::message::{Message, MessageType};

/// One `key='value'` component of a match expression.
///
/// Ordering of the variants fixes the level order of the tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Component {
    Type(MatchType),
    Sender(String),
    Destination(String),
    Interface(String),
    Member(String),
    Path(String),
    Arg(u8, String),
}

/// Message kinds a `type=` component can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchType {
    Signal,
    MethodCall,
    MethodReturn,
    Error,
}

impl MatchType {
    fn matches(self, ty: MessageType) -> bool {
        matches!(
            (self, ty),
            (MatchType::Signal, MessageType::Signal)
                | (MatchType::MethodCall, MessageType::MethodCall)
                | (MatchType::MethodReturn, MessageType::MethodReturn)
                | (MatchType::Error, MessageType::MethodError)
        )
    }
}

/// Parse a match expression into sorted components.
pub fn parse(rule: &str) -> Result<Vec<Component>> {
    let mut components = Vec::new();
    let mut rest = rule.trim();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| Error::invalid(format!("match component without '=': {:?}", rest)))?;
        let key = rest[..eq].trim();
        rest = &rest[eq + 1..];

        if !rest.starts_with('\'') {
            return Err(Error::invalid("match value is not quoted"));
        }
        rest = &rest[1..];
        let close = rest
            .find('\'')
            .ok_or_else(|| Error::invalid("unterminated match value"))?;
        let value = &rest[..close];
        rest = rest[close + 1..].trim_start();
        if let Some(r) = rest.strip_prefix(',') {
            rest = r.trim_start();
        } else if !rest.is_empty() {
            return Err(Error::invalid("garbage between match components"));
        }

        let component = match key {
            "type" => Component::Type(match value {
                "signal" => MatchType::Signal,
                "method_call" => MatchType::MethodCall,
                "method_return" => MatchType::MethodReturn,
                "error" => MatchType::Error,
                other => {
                    return Err(Error::invalid(format!("unknown match type {:?}", other)));
                }
            }),
            "sender" => Component::Sender(value.to_owned()),
            "destination" => Component::Destination(value.to_owned()),
            "interface" => Component::Interface(value.to_owned()),
            "member" => Component::Member(value.to_owned()),
            "path" => Component::Path(value.to_owned()),
            _ => {
                let Some(index) = key.strip_prefix("arg") else {
                    return Err(Error::invalid(format!("unknown match key {:?}", key)));
                };
                let index: u8 = index
                    .parse()
                    .map_err(|_| Error::invalid(format!("bad arg index in {:?}", key)))?;
                if index > 63 {
                    return Err(Error::invalid("arg index out of range"));
                }
                Component::Arg(index, value.to_owned())
            }
        };

        if components.contains(&component) {
            return Err(Error::invalid("duplicate match component"));
        }
        components.push(component);
    }

    components.sort();
    Ok(components)
}

impl Component {
    fn matches(&self, msg: &Message) -> bool {
        match self {
            Component::Type(t) => t.matches(msg.message_type()),
            Component::Sender(v) => msg.sender() == Some(v.as_str()),
            Component::Destination(v) => msg.destination() == Some(v.as_str()),
            Component::Interface(v) => msg.interface() == Some(v.as_str()),
            Component::Member(v) => msg.member() == Some(v.as_str()),
            Component::Path(v) => msg.path() == Some(v.as_str()),
            Component::Arg(n, v) => match msg.body_strings() {
                Ok(args) => args.get(*n as usize).map(|a| a.as_str()) == Some(v.as_str()),
                Err(_) => false,
            },
        }
    }
}

/// Handle returned by [`Connection::add_match`], used for removal.
///
/// [`Connection::add_match`]: crate::Connection::add_match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchId(u64);

struct MatchEntry {
    id: MatchId,
    rule: String,
    cookie: u64,
    handler: MessageHandler,
    last_iteration: u64,
}

#[derive(Default)]
struct MatchNode {
    children: BTreeMap<Component, MatchNode>,
    entries: Vec<MatchEntry>,
}

impl MatchNode {
    fn insert(&mut self, components: &[Component], entry: MatchEntry) {
        match components.split_first() {
            None => self.entries.push(entry),
            Some((head, tail)) => self
                .children
                .entry(head.clone())
                .or_default()
                .insert(tail, entry),
        }
    }

    fn collect<'a>(&'a self, msg: &Message, out: &mut Vec<&'a MatchEntry>) {
        out.extend(self.entries.iter());
        for (component, child) in &self.children {
            if component.matches(msg) {
                child.collect(msg, out);
            }
        }
    }

    fn remove(&mut self, id: MatchId) -> Option<(String, u64)> {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let e = self.entries.remove(pos);
            return Some((e.rule, e.cookie));
        }
        for child in self.children.values_mut() {
            if let Some(found) = child.remove(id) {
                return Some(found);
            }
        }
        None
    }

    fn prune(&mut self) {
        self.children.retain(|_, child| {
            child.prune();
            !child.entries.is_empty() || !child.children.is_empty()
        });
    }

    fn stamp(&mut self, id: MatchId, iteration: u64) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.last_iteration = iteration;
            return true;
        }
        self.children.values_mut().any(|c| c.stamp(id, iteration))
    }

    fn count(&self) -> usize {
        self.entries.len() + self.children.values().map(MatchNode::count).sum::<usize>()
    }
}

/// Component tree holding all registered match rules.
#[derive(Default)]
pub struct MatchTree {
    root: MatchNode,
    next_id: u64,
    modified: bool,
}

impl MatchTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.root.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a rule. `cookie` identifies the broker-side registration.
    pub fn add(&mut self, rule: &str, cookie: u64, handler: MessageHandler) -> Result<MatchId> {
        let components = parse(rule)?;
        self.next_id += 1;
        let id = MatchId(self.next_id);
        self.root.insert(
            &components,
            MatchEntry {
                id,
                rule: rule.to_owned(),
                cookie,
                handler,
                last_iteration: 0,
            },
        );
        self.modified = true;
        Ok(id)
    }

    /// Remove a rule, returning its text and broker cookie.
    pub fn remove(&mut self, id: MatchId) -> Option<(String, u64)> {
        let found = self.root.remove(id);
        if found.is_some() {
            self.root.prune();
            self.modified = true;
        }
        found
    }

    /// Snapshot of all entries whose components match `msg`: id, handler and
    /// last-run stamp, in tree order.
    pub(crate) fn matching(&self, msg: &Message) -> Vec<(MatchId, MessageHandler, u64)> {
        let mut entries = Vec::new();
        self.root.collect(msg, &mut entries);
        entries
            .into_iter()
            .map(|e| (e.id, e.handler.clone(), e.last_iteration))
            .collect()
    }

    pub(crate) fn stamp(&mut self, id: MatchId, iteration: u64) {
        self.root.stamp(id, iteration);
    }

    pub(crate) fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    pub fn clear(&mut self) {
        self.root = MatchNode::default();
        self.modified = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{handler, Handled};

    fn signal(path: &str, interface: &str, member: &str) -> Message {
        let mut m = Message::signal(path, interface, member).unwrap();
        m.seal(1).unwrap();
        Message::from_wire(m.wire().unwrap().to_vec(), Vec::new()).unwrap()
    }

    #[test]
    fn components_sort_into_canonical_order() {
        let c = parse("member='M',type='signal',interface='I.F'").unwrap();
        assert!(matches!(c[0], Component::Type(MatchType::Signal)));
        assert!(matches!(c[1], Component::Interface(_)));
        assert!(matches!(c[2], Component::Member(_)));
    }

    #[test]
    fn rejects_malformed_rules() {
        assert!(parse("interface=unquoted").is_err());
        assert!(parse("type='nonsense'").is_err());
        assert!(parse("arg99='x'").is_err());
        assert!(parse("bogus='x'").is_err());
    }

    #[test]
    fn matching_walks_only_matching_branches() {
        let mut tree = MatchTree::new();
        tree.add(
            "type='signal',interface='org.example.A'",
            1,
            handler(|_, _| Ok(Handled::No)),
        )
        .unwrap();
        tree.add(
            "type='signal',interface='org.example.B'",
            2,
            handler(|_, _| Ok(Handled::No)),
        )
        .unwrap();
        tree.add("path='/obj'", 3, handler(|_, _| Ok(Handled::No)))
            .unwrap();

        let msg = signal("/obj", "org.example.A", "Changed");
        assert_eq!(tree.matching(&msg).len(), 2);

        let msg = signal("/other", "org.example.B", "Changed");
        assert_eq!(tree.matching(&msg).len(), 1);
    }

    #[test]
    fn arg0_component_matches_body() {
        let mut tree = MatchTree::new();
        tree.add("arg0='hello'", 1, handler(|_, _| Ok(Handled::No)))
            .unwrap();

        let mut m = Message::signal("/o", "i.f", "S").unwrap();
        m.append_string("hello").unwrap();
        m.seal(1).unwrap();
        let m = Message::from_wire(m.wire().unwrap().to_vec(), Vec::new()).unwrap();
        assert_eq!(tree.matching(&m).len(), 1);

        let other = signal("/o", "i.f", "S");
        assert!(tree.matching(&other).is_empty());
    }

    #[test]
    fn remove_returns_rule_and_cookie() {
        let mut tree = MatchTree::new();
        let id = tree
            .add("member='Ping'", 77, handler(|_, _| Ok(Handled::No)))
            .unwrap();
        assert_eq!(tree.len(), 1);

        let (rule, cookie) = tree.remove(id).unwrap();
        assert_eq!(rule, "member='Ping'");
        assert_eq!(cookie, 77);
        assert!(tree.is_empty());
        assert!(tree.remove(id).is_none());
    }
}
