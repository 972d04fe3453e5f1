//! Invalidation Queue
//!
//! An ordered, de-duplicating queue of nodes waiting to run. Entries are
//! ordered by priority (higher first) and then by insertion order, so with
//! the default priority the queue is plain FIFO.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use super::node::NodeId;

type Slot = (Reverse<i32>, u64);

#[derive(Debug, Default)]
pub struct InvalidationQueue {
    order: BTreeMap<Slot, NodeId>,
    members: HashMap<NodeId, Slot>,
    next_seq: u64,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a node. Returns false if it is already queued.
    pub fn push(&mut self, id: NodeId, priority: i32) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }
        let slot = (Reverse(priority), self.next_seq);
        self.next_seq += 1;
        self.order.insert(slot, id);
        self.members.insert(id, slot);
        true
    }

    pub fn pop(&mut self) -> Option<NodeId> {
        let (_, id) = self.order.pop_first()?;
        self.members.remove(&id);
        Some(id)
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.members.remove(&id) {
            Some(slot) => {
                self.order.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Move every entry of `other` into this queue, keeping its order.
    pub fn append(&mut self, other: &mut InvalidationQueue) {
        while let Some((slot, id)) = other.order.pop_first() {
            other.members.remove(&id);
            self.push(id, slot.0 .0);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
