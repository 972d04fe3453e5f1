//! Reactive Context
//!
//! A `ReactiveContext` is the tracking frame of one running computation.
//! Every calc and effect body receives one, and reading a cell or calc
//! *through* it records the read as a dependency of the frame's owner.
//!
//! # Implementation
//!
//! Frames are explicit values rather than ambient thread-local state. Each
//! frame links to the frame of the computation that caused it to run, so the
//! chain of parents is the current execution path; cycle detection walks
//! that chain. Because the handle is an `Arc`, an async body can hold it
//! across `.await` points and keep recording into the right frame after it
//! resumes, on whichever thread it resumes.
//!
//! A frame is closed when its evaluation ends (normally, with an error, by
//! panic, or by the future being dropped). Reads through a closed frame are
//! ignored, so a context that escaped into a spawned task cannot add edges
//! after the fact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexSet;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::Notify;

use super::runtime::{wait_closed, RuntimeInner};
use crate::error::ReactiveError;
use crate::graph::{Evaluation, NodeId};

/// Handle to a tracking frame.
#[derive(Clone)]
pub struct ReactiveContext {
    frame: Arc<Frame>,
}

struct Frame {
    /// The node being evaluated. `None` for ad-hoc frames opened with
    /// `Runtime::with_tracking`, which record reads but own no edges.
    owner: Option<NodeId>,
    parent: Option<ReactiveContext>,
    runtime: Weak<RuntimeInner>,
    reads: Mutex<SmallVec<[NodeId; 8]>>,
    open: AtomicBool,
}

impl ReactiveContext {
    pub(crate) fn new(
        runtime: &Arc<RuntimeInner>,
        owner: Option<NodeId>,
        parent: Option<&ReactiveContext>,
    ) -> Self {
        Self {
            frame: Arc::new(Frame {
                owner,
                parent: parent.cloned(),
                runtime: Arc::downgrade(runtime),
                reads: Mutex::new(SmallVec::new()),
                open: AtomicBool::new(true),
            }),
        }
    }

    /// The node this frame records dependencies for.
    pub fn owner(&self) -> Option<NodeId> {
        self.frame.owner
    }

    /// Number of enclosing frames on this execution path.
    pub fn depth(&self) -> usize {
        self.ancestors().count() - 1
    }

    /// Whether reads are still being recorded.
    pub fn is_open(&self) -> bool {
        self.frame.open.load(Ordering::Acquire)
    }

    /// True once the owning session has been torn down. Long-running async
    /// bodies can poll this to stop early.
    pub fn is_cancelled(&self) -> bool {
        self.frame
            .runtime
            .upgrade()
            .map_or(true, |runtime| runtime.is_closed())
    }

    /// Nodes read through this frame so far, in first-read order.
    pub fn reads(&self) -> Vec<NodeId> {
        self.frame.reads.lock().to_vec()
    }

    /// Invalidate the owning node after `delay`, as if one of its
    /// dependencies had changed. Useful for polling and clocks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn invalidate_later(&self, delay: Duration) -> Result<(), ReactiveError> {
        let Some(owner) = self.frame.owner else {
            return Ok(());
        };
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| ReactiveError::NoExecutor)?;
        let runtime = self.frame.runtime.clone();
        let Some(closed) = runtime.upgrade().map(|rt| rt.closed_receiver()) else {
            return Err(ReactiveError::StaleRead { node: owner });
        };

        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Some(runtime) = runtime.upgrade() {
                        tracing::trace!(node = %owner, ?delay, "timer invalidation");
                        runtime.invalidate(owner);
                    }
                }
                _ = wait_closed(closed) => {}
            }
        });
        Ok(())
    }

    fn ancestors(&self) -> impl Iterator<Item = &ReactiveContext> {
        std::iter::successors(Some(self), |cx| cx.frame.parent.as_ref())
    }

    /// If `target` is already evaluating on this execution path, the path
    /// from its frame down to this one, with `target` appended.
    pub(crate) fn path_to(&self, target: NodeId) -> Option<Vec<NodeId>> {
        let owners: Vec<NodeId> = self.ancestors().filter_map(ReactiveContext::owner).collect();
        let depth = owners.iter().position(|owner| *owner == target)?;
        let mut path: Vec<NodeId> = owners[..=depth].iter().rev().copied().collect();
        path.push(target);
        Some(path)
    }

    /// Record a read of `dependency`, which belongs to `runtime`.
    pub(crate) fn track(
        &self,
        runtime: &Weak<RuntimeInner>,
        dependency: NodeId,
    ) -> Result<(), ReactiveError> {
        if !Weak::ptr_eq(&self.frame.runtime, runtime) {
            return Err(ReactiveError::ForeignSession { node: dependency });
        }
        if !self.is_open() {
            return Ok(());
        }
        let added = {
            let mut reads = self.frame.reads.lock();
            if reads.contains(&dependency) {
                false
            } else {
                reads.push(dependency);
                true
            }
        };
        if added {
            if let (Some(owner), Some(runtime)) = (self.frame.owner, runtime.upgrade()) {
                runtime.graph.lock().add_edge(dependency, owner);
            }
        }
        Ok(())
    }

    /// Stop recording. What was read so far stays available.
    pub(crate) fn stop(&self) {
        self.frame.open.store(false, Ordering::Release);
    }

    /// Stop recording and return what was read.
    pub(crate) fn close(&self) -> IndexSet<NodeId> {
        self.stop();
        std::mem::take(&mut *self.frame.reads.lock())
            .into_iter()
            .collect()
    }
}

impl std::fmt::Debug for ReactiveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveContext")
            .field("owner", &self.owner())
            .field("depth", &self.depth())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Stops an ad-hoc frame on every exit path.
pub(crate) struct StopOnDrop<'a>(pub(crate) &'a ReactiveContext);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Outcome of [`Tracking::begin`].
pub(crate) enum Begin {
    /// The cached result is current.
    Cached,
    /// The node is being evaluated elsewhere.
    InFlight,
    Run(Tracking),
}

/// The evaluation of one node: a frame plus the bookkeeping to commit or
/// discard what it recorded.
///
/// `finish` commits the new dependency set. Dropping without finishing
/// (error propagation with `?`, unwinding, a cancelled future) abandons the
/// evaluation: edges first seen in this run are removed and the node stays
/// invalid.
pub(crate) struct Tracking {
    runtime: Arc<RuntimeInner>,
    node: NodeId,
    cx: ReactiveContext,
    previous: IndexSet<NodeId>,
    finished: bool,
    settled: Option<Arc<Notify>>,
}

impl Tracking {
    /// Start evaluating `node`.
    pub(crate) fn begin(
        runtime: &Arc<RuntimeInner>,
        node: NodeId,
        parent: Option<&ReactiveContext>,
    ) -> Result<Begin, ReactiveError> {
        let evaluation = runtime.graph.lock().begin_evaluation(node)?;
        match evaluation {
            Evaluation::Cached => Ok(Begin::Cached),
            Evaluation::InFlight => Ok(Begin::InFlight),
            Evaluation::Run { previous } => Ok(Begin::Run(Self {
                runtime: Arc::clone(runtime),
                node,
                cx: ReactiveContext::new(runtime, Some(node), parent),
                previous,
                finished: false,
                settled: None,
            })),
        }
    }

    /// Wake every waiter on `settled` once this evaluation is committed or
    /// abandoned.
    pub(crate) fn notify_settled(mut self, settled: Arc<Notify>) -> Self {
        self.settled = Some(settled);
        self
    }

    pub(crate) fn context(&self) -> &ReactiveContext {
        &self.cx
    }

    /// Commit the evaluation. Returns true if the node was invalidated while
    /// it ran and therefore remains invalid.
    pub(crate) fn finish(mut self) -> bool {
        self.finished = true;
        let reads = self.cx.close();
        self.runtime.graph.lock().finish_evaluation(self.node, &reads)
    }
}

impl Drop for Tracking {
    fn drop(&mut self) {
        if !self.finished {
            let reads = self.cx.close();
            tracing::trace!(node = %self.node, "evaluation abandoned");
            self.runtime
                .graph
                .lock()
                .abandon_evaluation(self.node, &reads, &self.previous);
        }
        if let Some(settled) = &self.settled {
            settled.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Runtime;

    #[test]
    fn frames_record_reads_in_order_without_duplicates() {
        let runtime = Runtime::new();
        let a = runtime.new_cell(1);
        let b = runtime.new_cell(2);

        let (sum, reads) = runtime.with_tracking(|cx| {
            a.read(cx).unwrap() + b.read(cx).unwrap() + a.read(cx).unwrap()
        });

        assert_eq!(sum, 4);
        assert_eq!(reads.into_iter().collect::<Vec<_>>(), vec![a.id(), b.id()]);
    }

    #[test]
    fn nested_frames_report_depth_and_owner() {
        let runtime = Runtime::new();
        let outer_id = NodeId::new();
        let inner_id = NodeId::new();

        let outer = ReactiveContext::new(runtime.inner(), Some(outer_id), None);
        let inner = ReactiveContext::new(runtime.inner(), Some(inner_id), Some(&outer));

        assert_eq!(outer.depth(), 0);
        assert_eq!(inner.depth(), 1);
        assert_eq!(inner.owner(), Some(inner_id));
        assert_eq!(
            inner.path_to(outer_id),
            Some(vec![outer_id, inner_id, outer_id])
        );
        assert_eq!(inner.path_to(NodeId::new()), None);
    }

    #[test]
    fn closed_frames_ignore_reads() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);

        let (cx, reads) = runtime.with_tracking(|cx| cx.clone());
        assert!(reads.is_empty());
        assert!(!cx.is_open());

        assert_eq!(cell.read(&cx).unwrap(), 0);
        assert!(cx.reads().is_empty());
    }

    #[test]
    fn frames_reject_nodes_from_other_sessions() {
        let first = Runtime::new();
        let second = Runtime::new();
        let cell = second.new_cell(0);

        let (result, _) = first.with_tracking(|cx| cell.read(cx));
        assert!(matches!(
            result,
            Err(ReactiveError::ForeignSession { node }) if node == cell.id()
        ));
    }

    #[test]
    fn teardown_is_visible_as_cancellation() {
        let runtime = Runtime::new();
        let cx = ReactiveContext::new(runtime.inner(), None, None);
        assert!(!cx.is_cancelled());
        runtime.teardown();
        assert!(cx.is_cancelled());
    }
}
