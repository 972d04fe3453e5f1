//! Update Scheduler
//!
//! The scheduler owns one session's dependency graph and its flush state.
//!
//! # Algorithm
//!
//! 1. A cell write bumps the cell's version and walks its dependents. Valid
//!    calcs become invalid and the walk continues into their dependents;
//!    valid effects become invalid and are queued. Nodes that were already
//!    invalid stop the walk, so one write costs O(affected nodes).
//! 2. The flush loop pops queued effects one at a time. Calcs are never
//!    queued: they recompute when an effect (or anyone else) reads them.
//! 3. An effect invalidated again after it ran in the current pass goes to
//!    the next pass; an effect that failed in this flush waits for the next
//!    flush.
//!
//! Edges are added eagerly as a body reads, and pruned when the evaluation
//! finishes, so a write that lands mid-evaluation still reaches the
//! evaluating node.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use super::node::{Invalidation, Node, NodeId, NodeKind, NodeState};
use super::queue::InvalidationQueue;
use crate::error::ReactiveError;

/// Where a session is in its flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing pending.
    Idle,
    /// A write happened; a flush is due.
    Scheduled,
    /// The flush loop is draining the queue.
    Flushing,
}

/// How a node should be read.
#[derive(Debug)]
pub enum Evaluation {
    /// The cached result is current.
    Cached,
    /// Another evaluation of the node is still running.
    InFlight,
    /// Run the body. Carries the dependency set from before this evaluation.
    Run { previous: IndexSet<NodeId> },
}

/// The update scheduler manages the dependency graph and coordinates updates.
pub struct UpdateScheduler {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    state: FlushState,

    /// Effects to run in the current pass.
    queue: InvalidationQueue,

    /// Effects re-invalidated after already running in the current pass.
    next_pass: InvalidationQueue,

    /// Effects that failed this flush and were invalidated again.
    deferred: InvalidationQueue,

    ran_this_pass: HashSet<NodeId>,
    failed_this_flush: HashSet<NodeId>,
}

impl UpdateScheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            state: FlushState::Idle,
            queue: InvalidationQueue::new(),
            next_pass: InvalidationQueue::new(),
            deferred: InvalidationQueue::new(),
            ran_this_pass: HashSet::new(),
            failed_this_flush: HashSet::new(),
        }
    }

    /// Add a node to the graph. New effects are queued immediately.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        let is_effect = node.kind() == NodeKind::Effect;
        self.nodes.insert(id, node);
        if is_effect {
            self.enqueue(id);
            self.schedule();
        }
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node.
    pub fn remove_node(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.remove(&node_id) {
            for dep_id in node.dependencies() {
                if let Some(dep) = self.nodes.get_mut(dep_id) {
                    dep.remove_dependent(node_id);
                }
            }

            for dependent_id in node.dependents() {
                if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                    dependent.remove_dependency(node_id);
                }
            }

            self.queue.remove(node_id);
            self.next_pass.remove(node_id);
            self.deferred.remove(node_id);
        }
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// Both nodes must exist and be distinct. Returns true if the edge is new.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) -> bool {
        if dependency == dependent
            || !self.nodes.contains_key(&dependency)
            || !self.nodes.contains_key(&dependent)
        {
            return false;
        }
        let added = self
            .nodes
            .get_mut(&dependent)
            .map(|node| node.add_dependency(dependency))
            .unwrap_or(false);
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        added
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Record a counted write to `source` and invalidate everything
    /// downstream of it.
    ///
    /// Returns the number of effects newly queued.
    pub fn mark_changed(&mut self, source_id: NodeId) -> usize {
        let dependents: Vec<NodeId> = match self.nodes.get_mut(&source_id) {
            Some(source) => {
                source.bump_version();
                source.dependents().iter().copied().collect()
            }
            None => return 0,
        };
        self.schedule();
        self.propagate(dependents)
    }

    /// Invalidate one calc or effect directly, as if a dependency changed.
    pub fn invalidate(&mut self, node_id: NodeId) -> usize {
        if !self.nodes.contains_key(&node_id) {
            return 0;
        }
        self.schedule();
        self.propagate(vec![node_id])
    }

    fn propagate(&mut self, mut stack: Vec<NodeId>) -> usize {
        let mut queued = 0;
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            let outcome = node.invalidate();
            let kind = node.kind();
            match (kind, outcome) {
                (_, Invalidation::Unchanged) => {}
                (NodeKind::Calc, _) => {
                    stack.extend(node.dependents().iter().copied());
                }
                (NodeKind::Effect, Invalidation::Transitioned) => {
                    if self.enqueue(id) {
                        queued += 1;
                    }
                }
                // Requeued when its evaluation finishes.
                (NodeKind::Effect, Invalidation::DuringEvaluation) => {}
                (NodeKind::Cell, _) => {}
            }
        }
        queued
    }

    /// Put an invalid effect in the right queue for the current flush.
    fn enqueue(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.is_suspended() {
            node.set_parked(true);
            return false;
        }
        let priority = node.priority();
        if self.failed_this_flush.contains(&id) {
            self.deferred.push(id, priority)
        } else if self.ran_this_pass.contains(&id) {
            self.next_pass.push(id, priority)
        } else {
            self.queue.push(id, priority)
        }
    }

    fn schedule(&mut self) {
        if self.state == FlushState::Idle {
            self.state = FlushState::Scheduled;
        }
    }

    /// Start evaluating `node_id`.
    ///
    /// Valid calcs report `Cached`. A node that is already evaluating reports
    /// `InFlight`; whether that is a cycle depends on the reader's execution
    /// path, which only the caller knows.
    pub fn begin_evaluation(&mut self, node_id: NodeId) -> Result<Evaluation, ReactiveError> {
        let node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(ReactiveError::StaleRead { node: node_id })?;
        if node.kind() == NodeKind::Calc && node.state() == NodeState::Valid {
            return Ok(Evaluation::Cached);
        }
        if !node.begin_evaluation() {
            return Ok(Evaluation::InFlight);
        }
        Ok(Evaluation::Run {
            previous: node.dependencies().clone(),
        })
    }

    /// Commit an evaluation: prune edges that were not read this time.
    ///
    /// Returns true if the node was invalidated while it ran.
    pub fn finish_evaluation(&mut self, node_id: NodeId, reads: &IndexSet<NodeId>) -> bool {
        let stale: Vec<NodeId> = match self.nodes.get(&node_id) {
            Some(node) => node
                .dependencies()
                .iter()
                .filter(|dep| !reads.contains(*dep))
                .copied()
                .collect(),
            None => return false,
        };
        for dep in stale {
            self.remove_edge(dep, node_id);
        }

        let (invalidated, kind) = match self.nodes.get_mut(&node_id) {
            Some(node) => (node.finish_evaluation(), node.kind()),
            None => return false,
        };
        if invalidated && kind == NodeKind::Effect {
            self.enqueue(node_id);
        }
        invalidated
    }

    /// Discard an evaluation that did not complete.
    ///
    /// Edges recorded by the aborted run are dropped; the node keeps the
    /// dependency set of its last completed evaluation and stays invalid.
    pub fn abandon_evaluation(
        &mut self,
        node_id: NodeId,
        reads: &IndexSet<NodeId>,
        previous: &IndexSet<NodeId>,
    ) {
        for dep in reads.iter().filter(|dep| !previous.contains(*dep)) {
            self.remove_edge(*dep, node_id);
        }
        let (kind, priority) = match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.abandon_evaluation();
                (node.kind(), node.priority())
            }
            None => return,
        };
        if kind == NodeKind::Effect {
            self.deferred.push(node_id, priority);
        }
    }

    /// Enter the `Flushing` state. Returns false if there is nothing to do
    /// or a flush is already running.
    pub fn begin_flush(&mut self) -> bool {
        match self.state {
            FlushState::Flushing => false,
            FlushState::Idle if self.queue.is_empty() => false,
            FlushState::Idle | FlushState::Scheduled => {
                self.state = FlushState::Flushing;
                true
            }
        }
    }

    /// Pop the next effect to run in this pass.
    pub fn next_effect(&mut self) -> Option<NodeId> {
        while let Some(id) = self.queue.pop() {
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if node.is_suspended() {
                node.set_parked(true);
                continue;
            }
            self.ran_this_pass.insert(id);
            return Some(id);
        }
        None
    }

    /// Exclude `node_id` from the rest of this flush.
    pub fn mark_failed(&mut self, node_id: NodeId) {
        self.failed_this_flush.insert(node_id);
        if self.queue.remove(node_id) || self.next_pass.remove(node_id) {
            let priority = self.nodes.get(&node_id).map_or(0, Node::priority);
            self.deferred.push(node_id, priority);
        }
    }

    /// Close the current pass. Returns true if another pass is needed.
    pub fn advance_pass(&mut self) -> bool {
        self.ran_this_pass.clear();
        self.queue.append(&mut self.next_pass);
        !self.queue.is_empty()
    }

    /// Leave the `Flushing` state.
    ///
    /// Effects deferred because they failed stay queued for the next flush
    /// without scheduling one on their own.
    pub fn end_flush(&mut self) {
        self.ran_this_pass.clear();
        self.failed_this_flush.clear();
        self.queue.append(&mut self.next_pass);
        self.queue.append(&mut self.deferred);
        self.state = FlushState::Idle;
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Returns true if a call to `begin_flush` would start a flush.
    pub fn has_pending_work(&self) -> bool {
        self.state == FlushState::Scheduled || !self.queue.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn set_priority(&mut self, node_id: NodeId, priority: i32) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.set_priority(priority);
        }
    }

    pub fn suspend(&mut self, node_id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.set_suspended(true);
        }
    }

    /// Resume a suspended effect. Returns true if it was parked and is now
    /// queued.
    pub fn resume(&mut self, node_id: NodeId) -> bool {
        let parked = match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.set_suspended(false);
                let parked = node.is_parked();
                node.set_parked(false);
                parked
            }
            None => return false,
        };
        if parked && self.enqueue(node_id) {
            self.schedule();
            return true;
        }
        false
    }

    /// Drop every node and pending entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.queue.clear();
        self.next_pass.clear();
        self.deferred.clear();
        self.ran_this_pass.clear();
        self.failed_this_flush.clear();
        self.state = FlushState::Idle;
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}
