//! Cell Implementation
//!
//! A Cell is the fundamental reactive primitive: a mutable, versioned value
//! whose writes invalidate everything that read it.
//!
//! # How Cells Work
//!
//! 1. Reading a cell through a `ReactiveContext` adds an edge from the cell
//!    to the frame's owner in the session graph.
//!
//! 2. Writing a cell bumps its version and marks every dependent invalid.
//!    Nothing is recomputed at write time; the next flush does that.
//!
//! 3. Whether writing an equal value counts as a change is a per-cell
//!    `WritePolicy`, fixed when the cell is created.
//!
//! The graph holds only the cell's id. The value lives in the handle, and
//! dropping the last handle removes the node from the graph.

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::context::ReactiveContext;
use super::runtime::{Runtime, RuntimeInner};
use crate::error::ReactiveError;
use crate::graph::{Node, NodeId};

/// Decides whether a write of a value equal to the current one invalidates
/// dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WritePolicy {
    /// Every write counts as a change.
    #[default]
    Always,

    /// Writes equal to the current value (by `PartialEq`) are ignored.
    SkipIfEqual,
}

/// A reactive cell holding a value of type T.
///
/// # Example
///
/// ```rust
/// use reactor_core::reactive::Runtime;
///
/// let runtime = Runtime::new();
/// let count = runtime.new_cell(0);
///
/// assert_eq!(count.get().unwrap(), 0);
/// count.write(5).unwrap();
/// assert_eq!(count.get().unwrap(), 5);
/// ```
pub struct Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CellInner<T>>,
}

struct CellInner<T> {
    id: NodeId,
    runtime: Weak<RuntimeInner>,
    value: Mutex<T>,
    equals: Option<fn(&T, &T) -> bool>,
}

impl<T> CellInner<T> {
    fn runtime(&self) -> Result<Arc<RuntimeInner>, ReactiveError> {
        self.runtime
            .upgrade()
            .filter(|runtime| !runtime.is_closed())
            .ok_or(ReactiveError::StaleRead { node: self.id })
    }
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.release(self.id);
        }
    }
}

impl Runtime {
    /// Create a cell whose every write counts as a change.
    pub fn new_cell<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        Cell::create(self, value, None)
    }

    /// Create a cell that ignores writes equal to its current value.
    pub fn new_cell_deduped<T>(&self, value: T) -> Cell<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        Cell::create(self, value, Some(<T as PartialEq>::eq))
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn create(runtime: &Runtime, value: T, equals: Option<fn(&T, &T) -> bool>) -> Self {
        let id = runtime.inner().add_node(Node::cell());
        Self {
            inner: Arc::new(CellInner {
                id,
                runtime: runtime.downgrade(),
                value: Mutex::new(value),
                equals,
            }),
        }
    }

    /// Get the cell's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn policy(&self) -> WritePolicy {
        if self.inner.equals.is_some() {
            WritePolicy::SkipIfEqual
        } else {
            WritePolicy::Always
        }
    }

    /// Read the value and record it as a dependency of `cx`'s owner.
    pub fn read(&self, cx: &ReactiveContext) -> Result<T, ReactiveError> {
        self.inner.runtime()?;
        cx.track(&self.inner.runtime, self.inner.id)?;
        Ok(self.inner.value.lock().clone())
    }

    /// Read the value without recording a dependency.
    pub fn get(&self) -> Result<T, ReactiveError> {
        self.inner.runtime()?;
        Ok(self.inner.value.lock().clone())
    }

    /// Store a new value.
    ///
    /// Returns whether the write counted as a change. A change bumps the
    /// version, invalidates every dependent and schedules a flush; it never
    /// recomputes anything synchronously.
    pub fn write(&self, value: T) -> Result<bool, ReactiveError> {
        let runtime = self.inner.runtime()?;
        {
            let mut slot = self.inner.value.lock();
            if let Some(equals) = self.inner.equals {
                if equals(&slot, &value) {
                    return Ok(false);
                }
            }
            *slot = value;
        }
        runtime.mark_changed(self.inner.id);
        Ok(true)
    }

    /// Write a value derived from the current one.
    pub fn update<F>(&self, f: F) -> Result<bool, ReactiveError>
    where
        F: FnOnce(&T) -> T,
    {
        // `f` may read this cell, so it runs on a copy.
        let current = self.inner.value.lock().clone();
        self.write(f(&current))
    }

    /// Number of counted writes so far. Zero once the session is gone.
    pub fn version(&self) -> u64 {
        self.with_node(Node::version).unwrap_or(0)
    }

    /// Get the number of nodes that currently depend on this cell.
    pub fn dependent_count(&self) -> usize {
        self.with_node(|node| node.dependents().len()).unwrap_or(0)
    }

    fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let runtime = self.inner.runtime().ok()?;
        let graph = runtime.graph.lock();
        let result = graph.get_node(self.inner.id).map(f);
        result
    }
}

impl<T> Clone for Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.lock())
            .field("version", &self.version())
            .field("policy", &self.policy())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_get_and_write() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        assert_eq!(cell.get().unwrap(), 0);

        assert!(cell.write(42).unwrap());
        assert_eq!(cell.get().unwrap(), 42);
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn cell_update() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(10);
        cell.update(|v| v + 5).unwrap();
        assert_eq!(cell.get().unwrap(), 15);
    }

    #[test]
    fn equal_writes_count_by_default() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(3);
        assert_eq!(cell.policy(), WritePolicy::Always);

        assert!(cell.write(3).unwrap());
        assert!(cell.write(3).unwrap());
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn deduped_cells_skip_equal_writes() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell_deduped(String::from("a"));
        assert_eq!(cell.policy(), WritePolicy::SkipIfEqual);

        assert!(!cell.write(String::from("a")).unwrap());
        assert_eq!(cell.version(), 0);
        assert_eq!(runtime.state(), crate::graph::FlushState::Idle);

        assert!(cell.write(String::from("b")).unwrap());
        assert_eq!(cell.version(), 1);
    }

    #[test]
    fn tracked_reads_register_dependents() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(1);
        let calc = runtime.declare_calc({
            let cell = cell.clone();
            move |cx| Ok(cell.read(cx)? + 1)
        });

        let other = runtime.new_cell(2);

        assert_eq!(cell.dependent_count(), 0);
        assert_eq!(calc.get().unwrap(), 2);
        assert_eq!(cell.dependent_count(), 1);

        // Untracked reads are not recorded; an ad-hoc frame adds no edges.
        let (sum, reads) =
            runtime.with_tracking(|cx| cell.get().unwrap() + other.read(cx).unwrap());
        assert_eq!(sum, 3);
        assert_eq!(reads.into_iter().collect::<Vec<_>>(), vec![other.id()]);
        assert_eq!(cell.dependent_count(), 1);
        assert_eq!(other.dependent_count(), 0);
    }

    #[test]
    fn cell_clone_shares_state() {
        let runtime = Runtime::new();
        let cell1 = runtime.new_cell(0);
        let cell2 = cell1.clone();

        cell1.write(42).unwrap();
        assert_eq!(cell2.get().unwrap(), 42);
        assert_eq!(cell1.id(), cell2.id());
    }

    #[test]
    fn dropping_the_last_handle_releases_the_node() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let clone = cell.clone();
        assert_eq!(runtime.node_count(), 1);

        drop(cell);
        assert_eq!(runtime.node_count(), 1);
        drop(clone);
        assert_eq!(runtime.node_count(), 0);
    }

    #[test]
    fn reads_and_writes_fail_after_teardown() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(1);
        runtime.teardown();

        assert!(matches!(
            cell.get(),
            Err(ReactiveError::StaleRead { node }) if node == cell.id()
        ));
        assert!(matches!(
            cell.write(2),
            Err(ReactiveError::StaleRead { .. })
        ));
        assert_eq!(cell.version(), 0);
    }
}
