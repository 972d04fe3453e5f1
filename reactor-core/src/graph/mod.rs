//! Dependency Graph
//!
//! This module implements the per-session dependency graph that tracks
//! relationships between cells, calcs and effects, together with the
//! invalidation queue and flush state machine that drive re-execution.
//!
//! # Overview
//!
//! - Nodes are cells (sources), calcs (derived values) or effects (sinks).
//! - Edges point from a dependency to its dependent: if B reads A there is
//!   an edge A -> B.
//!
//! A write to a cell walks the edges forward, marking calcs invalid and
//! queueing effects. Nothing is recomputed during the walk; the flush loop
//! runs the queued effects and they pull whatever calcs they read.
//!
//! # Design Decisions
//!
//! 1. One centralized graph per session rather than edges stored on each
//!    handle. Handles only hold a `NodeId`, so dropping one never leaves
//!    dangling pointers, and tearing a session down is a single `clear`.
//!
//! 2. The graph is indexed by node ID for O(1) lookups.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    so pruning a stale dependency and propagating a write are both cheap.

mod node;
mod queue;
mod scheduler;

pub use node::{Invalidation, Node, NodeId, NodeKind, NodeState};
pub use queue::InvalidationQueue;
pub use scheduler::{Evaluation, FlushState, UpdateScheduler};
