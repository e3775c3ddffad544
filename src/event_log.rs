//! Per-share event DAG.
//!
//! Events are indexed by parent. Replay walks the DAG depth-first from the
//! null root, visiting siblings in event id order, so two replicas holding
//! the same set of events replay them identically regardless of the order
//! they arrived in. Events whose parent is unknown stay stored and become
//! reachable once the parent shows up.

use std::collections::{BTreeMap, HashMap};

use crate::event::Event;
use crate::ids::{EventId, UserId};

#[derive(Debug, Default, Clone)]
pub struct EventLog {
    by_parent: HashMap<EventId, Vec<EventId>>,
    by_id: HashMap<EventId, Event>,
    head: EventId,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.by_id.get(id)
    }

    /// Last event applied to the materialized state.
    pub fn head(&self) -> &EventId {
        &self.head
    }

    pub fn set_head(&mut self, head: EventId) {
        self.head = head;
    }

    /// Store an event. Returns `false` for duplicates.
    pub fn insert(&mut self, event: Event) -> bool {
        if self.by_id.contains_key(event.id()) {
            return false;
        }
        let siblings = self.by_parent.entry(event.parent().clone()).or_default();
        let pos = siblings.binary_search(event.id()).unwrap_or_else(|p| p);
        siblings.insert(pos, event.id().clone());
        self.by_id.insert(event.id().clone(), event);
        true
    }

    /// Children of an event in replay order.
    pub fn children(&self, parent: &EventId) -> impl Iterator<Item = &Event> {
        self.by_parent
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    /// Every event reachable from the null root, in replay order.
    pub fn replay_order(&self) -> Vec<&Event> {
        let mut order = Vec::with_capacity(self.by_id.len());
        let mut stack: Vec<&EventId> = Vec::new();
        if let Some(roots) = self.by_parent.get(&EventId::root()) {
            stack.extend(roots.iter().rev());
        }
        while let Some(id) = stack.pop() {
            let Some(event) = self.by_id.get(id) else { continue };
            order.push(event);
            if let Some(children) = self.by_parent.get(id) {
                stack.extend(children.iter().rev());
            }
        }
        order
    }

    /// Events not reachable from the null root yet.
    pub fn unreachable(&self) -> usize {
        self.by_id.len() - self.replay_order().len()
    }

    /// Reachable events grouped by issuer, each list in replay order.
    pub fn lines(&self) -> BTreeMap<UserId, Vec<&Event>> {
        let mut lines: BTreeMap<UserId, Vec<&Event>> = BTreeMap::new();
        for event in self.replay_order() {
            if let Some(issuer) = event.issuer() {
                lines.entry(issuer).or_default().push(event);
            }
        }
        lines
    }

    /// Latest reachable event of every issuer.
    pub fn frontier(&self) -> BTreeMap<UserId, EventId> {
        self.lines()
            .into_iter()
            .filter_map(|(user, line)| Some((user, line.last()?.id().clone())))
            .collect()
    }

    /// Events of `issuer` after `after` (everything when `after` is the
    /// null id). `None` when `after` is not part of the issuer's line.
    pub fn line_after(&self, issuer: &UserId, after: &EventId) -> Option<Vec<&Event>> {
        let lines = self.lines();
        let line = lines.get(issuer).cloned().unwrap_or_default();
        if after.is_root() {
            return Some(line);
        }
        let pos = line.iter().position(|e| e.id() == after)?;
        Some(line[pos + 1..].to_vec())
    }

    /// All stored events, reachable or not, sorted by id.
    pub fn events(&self) -> Vec<&Event> {
        let mut events: Vec<&Event> = self.by_id.values().collect();
        events.sort();
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::identity::LocalIdentity;
    use crate::ids::ItemId;
    use pretty_assertions::assert_eq;

    fn delete(local: &LocalIdentity, parent: &EventId) -> Event {
        Event::issue(local, parent.clone(), Some(ItemId::generate()), EventKind::Delete).unwrap()
    }

    fn chain(local: &LocalIdentity, n: usize) -> Vec<Event> {
        let mut parent = EventId::root();
        (0..n)
            .map(|_| {
                let e = delete(local, &parent);
                parent = e.id().clone();
                e
            })
            .collect()
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let me = LocalIdentity::generate("a", "A").unwrap();
        let event = delete(&me, &EventId::root());
        let mut log = EventLog::new();
        assert!(log.insert(event.clone()));
        assert!(!log.insert(event));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_replay_order_is_independent_of_arrival() {
        let alice = LocalIdentity::generate("a", "A").unwrap();
        let bob = LocalIdentity::generate("b", "B").unwrap();
        let mut events = chain(&alice, 3);
        let fork = delete(&bob, events[0].id());
        events.push(fork);
        events.push(delete(&bob, &EventId::root()));

        let mut forward = EventLog::new();
        for e in events.iter().cloned() {
            forward.insert(e);
        }
        let mut backward = EventLog::new();
        for e in events.iter().rev().cloned() {
            backward.insert(e);
        }

        let ids = |log: &EventLog| -> Vec<EventId> {
            log.replay_order().into_iter().map(|e| e.id().clone()).collect()
        };
        assert_eq!(ids(&forward), ids(&backward));
        assert_eq!(forward.replay_order().len(), 5);
    }

    #[test]
    fn test_orphans_wait_for_parent() {
        let me = LocalIdentity::generate("a", "A").unwrap();
        let events = chain(&me, 3);
        let mut log = EventLog::new();
        log.insert(events[2].clone());
        log.insert(events[1].clone());
        assert_eq!(log.replay_order().len(), 0);
        assert_eq!(log.unreachable(), 2);

        log.insert(events[0].clone());
        assert_eq!(log.replay_order().len(), 3);
        assert_eq!(log.unreachable(), 0);
    }

    #[test]
    fn test_frontier_and_line_after() {
        let alice = LocalIdentity::generate("a", "A").unwrap();
        let events = chain(&alice, 4);
        let mut log = EventLog::new();
        for e in events.iter().cloned() {
            log.insert(e);
        }

        let frontier = log.frontier();
        assert_eq!(frontier.get(alice.user_id()), Some(events[3].id()));

        let after: Vec<EventId> = log
            .line_after(alice.user_id(), events[1].id())
            .unwrap()
            .into_iter()
            .map(|e| e.id().clone())
            .collect();
        assert_eq!(after, vec![events[2].id().clone(), events[3].id().clone()]);

        assert_eq!(log.line_after(alice.user_id(), &EventId::root()).unwrap().len(), 4);
        assert!(log
            .line_after(alice.user_id(), &EventId::parse("x:unknown").unwrap())
            .is_none());
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let me = LocalIdentity::generate("a", "A").unwrap();
        let mut log = EventLog::new();
        for e in chain(&me, 2000) {
            log.insert(e);
        }
        assert_eq!(log.replay_order().len(), 2000);
    }
}
