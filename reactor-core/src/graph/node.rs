//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A value cell. Roots of the graph: dependents only, never dependencies.
    Cell,

    /// A memoized derived computation. Has dependencies and dependents.
    Calc,

    /// A side-effecting computation. Leaves of the graph.
    Effect,
}

/// Validity of a node's last evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Up to date with the current version of every dependency.
    Valid,

    /// Needs recomputation (calc) or re-execution (effect).
    Invalid,

    /// The body is running. `invalidated` records whether a dependency
    /// changed after the evaluation started.
    Evaluating { invalidated: bool },
}

/// Outcome of invalidating a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// The node was valid and is now invalid.
    Transitioned,

    /// The node is mid-evaluation; its result will not be marked valid.
    DuringEvaluation,

    /// Nothing to do: the node was already invalid, or is a cell.
    Unchanged,
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// What kind of node this is.
    kind: NodeKind,

    state: NodeState,

    /// Bumped on every counted write (cells) or completed evaluation.
    version: u64,

    /// Queue ordering for effects; higher runs first.
    priority: i32,

    suspended: bool,

    /// Set when a suspended effect was invalidated and is waiting for `resume`.
    parked: bool,

    /// Nodes that this node read during its last evaluation.
    dependencies: IndexSet<NodeId>,

    /// Nodes that read this node.
    dependents: IndexSet<NodeId>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            state: match kind {
                NodeKind::Cell => NodeState::Valid,
                // Derived nodes start invalid so the first read evaluates
                // and the first flush runs every effect.
                NodeKind::Calc | NodeKind::Effect => NodeState::Invalid,
            },
            version: 0,
            priority: 0,
            suspended: false,
            parked: false,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn cell() -> Self {
        Self::new(NodeKind::Cell)
    }

    pub fn calc() -> Self {
        Self::new(NodeKind::Calc)
    }

    pub fn effect() -> Self {
        Self::new(NodeKind::Effect)
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == NodeState::Valid
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn set_parked(&mut self, parked: bool) {
        self.parked = parked;
    }

    /// Mark the node stale.
    pub fn invalidate(&mut self) -> Invalidation {
        match (self.kind, self.state) {
            (NodeKind::Cell, _) => Invalidation::Unchanged,
            (_, NodeState::Valid) => {
                self.state = NodeState::Invalid;
                Invalidation::Transitioned
            }
            (_, NodeState::Evaluating { invalidated: false }) => {
                self.state = NodeState::Evaluating { invalidated: true };
                Invalidation::DuringEvaluation
            }
            (_, NodeState::Evaluating { invalidated: true }) => Invalidation::Unchanged,
            (_, NodeState::Invalid) => Invalidation::Unchanged,
        }
    }

    /// Enter the evaluating state. Returns false if already evaluating.
    pub fn begin_evaluation(&mut self) -> bool {
        if matches!(self.state, NodeState::Evaluating { .. }) {
            return false;
        }
        self.state = NodeState::Evaluating { invalidated: false };
        true
    }

    /// Leave the evaluating state.
    ///
    /// Returns true if the node was invalidated mid-evaluation, in which
    /// case it stays invalid.
    pub fn finish_evaluation(&mut self) -> bool {
        let invalidated = matches!(self.state, NodeState::Evaluating { invalidated: true });
        self.state = if invalidated {
            NodeState::Invalid
        } else {
            NodeState::Valid
        };
        self.version += 1;
        invalidated
    }

    /// Leave the evaluating state without producing a result.
    pub fn abandon_evaluation(&mut self) {
        self.state = NodeState::Invalid;
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.insert(node_id)
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.shift_remove(&node_id);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn cells_start_valid_and_ignore_invalidation() {
        let mut node = Node::cell();
        assert_eq!(node.kind(), NodeKind::Cell);
        assert!(node.is_valid());
        assert_eq!(node.invalidate(), Invalidation::Unchanged);
        assert!(node.is_valid());
    }

    #[test]
    fn derived_nodes_start_invalid() {
        assert_eq!(Node::calc().state(), NodeState::Invalid);
        assert_eq!(Node::effect().state(), NodeState::Invalid);
    }

    #[test]
    fn invalidation_only_transitions_valid_nodes() {
        let mut node = Node::calc();
        assert!(node.begin_evaluation());
        assert!(!node.finish_evaluation());
        assert!(node.is_valid());

        assert_eq!(node.invalidate(), Invalidation::Transitioned);
        assert_eq!(node.invalidate(), Invalidation::Unchanged);
        assert_eq!(node.state(), NodeState::Invalid);
    }

    #[test]
    fn invalidation_during_evaluation_keeps_node_invalid() {
        let mut node = Node::effect();
        assert!(node.begin_evaluation());
        assert!(!node.begin_evaluation());

        assert_eq!(node.invalidate(), Invalidation::DuringEvaluation);
        assert_eq!(node.invalidate(), Invalidation::Unchanged);
        assert!(node.finish_evaluation());
        assert_eq!(node.state(), NodeState::Invalid);
    }

    #[test]
    fn dependency_management() {
        let mut node = Node::calc();
        let dep1 = NodeId::new();
        let dep2 = NodeId::new();

        assert!(node.add_dependency(dep1));
        assert!(node.add_dependency(dep2));
        assert!(!node.add_dependency(dep1));
        assert_eq!(node.dependencies().len(), 2);

        node.remove_dependency(dep1);
        assert!(!node.dependencies().contains(&dep1));
        assert_eq!(node.dependencies().len(), 1);
    }

    #[test]
    fn display_uses_raw_id() {
        assert_eq!(NodeId::from(12).to_string(), "#12");
    }
}
