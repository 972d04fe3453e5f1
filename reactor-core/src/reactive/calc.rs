//! Calc Implementation
//!
//! A Calc is a cached derived value that re-evaluates only when one of its
//! dependencies changes.
//!
//! # How Calcs Work
//!
//! 1. On first read, the calc runs its computation in a fresh tracking frame
//!    and caches the result. The frame's reads become its dependency set.
//!
//! 2. Reads while the calc is valid return the cache without running
//!    anything.
//!
//! 3. A write upstream marks the calc invalid. Nothing recomputes until the
//!    next read pulls it, so calcs nobody reads cost nothing.
//!
//! # Cached Failures
//!
//! The cache slot holds a `Result`. A computation that fails (or panics,
//! when `catch_panics` is on) caches the error, and every read re-surfaces
//! the same error until the calc is invalidated. Errors read from an
//! upstream calc through `?` are cached verbatim, so a chain of calcs
//! reports the original failure rather than a wrapper per level.
//!
//! # Async Calcs
//!
//! A calc declared with `declare_async_calc` may await. Its frame handle is
//! moved into the future, so reads after a suspension still land in the
//! right frame. Tearing the session down cancels the evaluation at its next
//! suspension point; whatever it read so far is discarded.
//!
//! Readers that arrive while an async evaluation is suspended wait for it to
//! settle and then read the cache, so concurrent awaits inside one body
//! share a single evaluation.

use std::fmt::Debug;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::context::{Begin, ReactiveContext, Tracking};
use super::runtime::{run_async_body, run_body, Runtime, RuntimeInner};
use crate::error::{EvalError, ReactiveError};
use crate::graph::{Node, NodeId, NodeState};

type SyncCompute<T> = Box<dyn Fn(&ReactiveContext) -> Result<T, EvalError> + Send + Sync>;
type AsyncCompute<T> =
    Box<dyn Fn(ReactiveContext) -> BoxFuture<'static, Result<T, EvalError>> + Send + Sync>;

enum Compute<T> {
    Sync(SyncCompute<T>),
    Async(AsyncCompute<T>),
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust
/// use reactor_core::reactive::Runtime;
///
/// let runtime = Runtime::new();
/// let count = runtime.new_cell(2);
/// let doubled = runtime.declare_calc({
///     let count = count.clone();
///     move |cx| Ok(count.read(cx)? * 2)
/// });
///
/// assert_eq!(doubled.get().unwrap(), 4);
/// count.write(5).unwrap();
/// assert_eq!(doubled.get().unwrap(), 10);
/// ```
pub struct Calc<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<CalcInner<T>>,
}

struct CalcInner<T> {
    id: NodeId,
    runtime: Weak<RuntimeInner>,
    compute: Compute<T>,
    cache: Mutex<Option<Result<T, ReactiveError>>>,
    evaluations: AtomicUsize,
    /// Notified whenever an evaluation ends.
    settled: Arc<Notify>,
}

impl<T> Drop for CalcInner<T> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.release(self.id);
        }
    }
}

enum Step<T> {
    Cached(Result<T, ReactiveError>),
    InFlight,
    Run(Tracking),
}

impl Runtime {
    /// Declare a calc from a synchronous computation.
    pub fn declare_calc<T, F>(&self, compute: F) -> Calc<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&ReactiveContext) -> Result<T, EvalError> + Send + Sync + 'static,
    {
        Calc::create(self, Compute::Sync(Box::new(compute)))
    }

    /// Declare a calc whose computation may suspend.
    ///
    /// Read it with [`Calc::get_async`] or [`Calc::read_async`]; synchronous
    /// reads only succeed while the cached result is valid.
    pub fn declare_async_calc<T, F, Fut>(&self, compute: F) -> Calc<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(ReactiveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, EvalError>> + Send + 'static,
    {
        Calc::create(
            self,
            Compute::Async(Box::new(move |cx| compute(cx).boxed())),
        )
    }
}

impl<T> Calc<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn create(runtime: &Runtime, compute: Compute<T>) -> Self {
        let id = runtime.inner().add_node(Node::calc());
        Self {
            inner: Arc::new(CalcInner {
                id,
                runtime: runtime.downgrade(),
                compute,
                cache: Mutex::new(None),
                evaluations: AtomicUsize::new(0),
                settled: Arc::new(Notify::new()),
            }),
        }
    }

    /// Get the calc's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn is_async(&self) -> bool {
        matches!(self.inner.compute, Compute::Async(_))
    }

    /// Get the current value without registering a dependency.
    pub fn get(&self) -> Result<T, ReactiveError> {
        self.evaluate(None)
    }

    /// Get the current value and register this calc as a dependency of
    /// `cx`'s owner.
    ///
    /// Only the calc itself is registered; its own dependencies stay on it.
    pub fn read(&self, cx: &ReactiveContext) -> Result<T, ReactiveError> {
        self.enter(cx)?;
        self.evaluate(Some(cx))
    }

    /// Async counterpart of [`get`](Self::get).
    pub async fn get_async(&self) -> Result<T, ReactiveError> {
        self.evaluate_async(None).await
    }

    /// Async counterpart of [`read`](Self::read).
    pub async fn read_async(&self, cx: &ReactiveContext) -> Result<T, ReactiveError> {
        self.enter(cx)?;
        self.evaluate_async(Some(cx)).await
    }

    /// Mark the calc invalid, and everything downstream of it.
    pub fn invalidate(&self) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.invalidate(self.inner.id);
        }
    }

    pub fn state(&self) -> NodeState {
        self.with_node(|node| node.state()).unwrap_or(NodeState::Invalid)
    }

    /// Returns true if the cached result is current.
    pub fn is_valid(&self) -> bool {
        self.state() == NodeState::Valid
    }

    /// Returns true if a result (value or error) has ever been cached.
    pub fn has_value(&self) -> bool {
        self.inner.cache.lock().is_some()
    }

    /// Number of times the computation has completed.
    pub fn evaluation_count(&self) -> usize {
        self.inner.evaluations.load(Ordering::Relaxed)
    }

    pub fn dependency_count(&self) -> usize {
        self.with_node(|node| node.dependencies().len()).unwrap_or(0)
    }

    pub fn dependent_count(&self) -> usize {
        self.with_node(|node| node.dependents().len()).unwrap_or(0)
    }

    fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let runtime = self.inner.runtime.upgrade()?;
        let graph = runtime.graph.lock();
        let result = graph.get_node(self.inner.id).map(f);
        result
    }

    fn runtime(&self) -> Result<Arc<RuntimeInner>, ReactiveError> {
        self.inner
            .runtime
            .upgrade()
            .filter(|runtime| !runtime.is_closed())
            .ok_or(ReactiveError::StaleRead { node: self.inner.id })
    }

    /// Register with the reader's frame, refusing to re-enter a calc that is
    /// already evaluating on this execution path.
    ///
    /// The edge is recorded even for a cycle, so a reader that caches the
    /// cycle error is invalidated once the cycle is broken upstream.
    fn enter(&self, cx: &ReactiveContext) -> Result<(), ReactiveError> {
        cx.track(&self.inner.runtime, self.inner.id)?;
        match cx.path_to(self.inner.id) {
            Some(path) => Err(ReactiveError::Cycle { path }),
            None => Ok(()),
        }
    }

    fn begin(
        &self,
        runtime: &Arc<RuntimeInner>,
        parent: Option<&ReactiveContext>,
    ) -> Result<Step<T>, ReactiveError> {
        match Tracking::begin(runtime, self.inner.id, parent)? {
            Begin::Run(tracking) => return Ok(self.run(tracking)),
            Begin::InFlight => return Ok(Step::InFlight),
            Begin::Cached => {}
        }
        let cached = self.inner.cache.lock().clone();
        if let Some(cached) = cached {
            return Ok(Step::Cached(cached));
        }
        // Valid with nothing cached: force a run.
        if let Some(node) = runtime.graph.lock().get_node_mut(self.inner.id) {
            node.invalidate();
        }
        match Tracking::begin(runtime, self.inner.id, parent)? {
            Begin::Run(tracking) => Ok(self.run(tracking)),
            Begin::InFlight | Begin::Cached => Err(ReactiveError::StaleRead {
                node: self.inner.id,
            }),
        }
    }

    fn run(&self, tracking: Tracking) -> Step<T> {
        Step::Run(tracking.notify_settled(Arc::clone(&self.inner.settled)))
    }

    /// The error for a reader that cannot wait on an in-flight evaluation.
    fn in_flight(&self) -> ReactiveError {
        let node = self.inner.id;
        if self.is_async() {
            ReactiveError::RequiresAsync { node }
        } else {
            // Sync bodies never suspend, so the only way back in is through
            // the running body itself.
            ReactiveError::Cycle {
                path: vec![node, node],
            }
        }
    }

    fn evaluate(&self, parent: Option<&ReactiveContext>) -> Result<T, ReactiveError> {
        let runtime = self.runtime()?;
        let tracking = match self.begin(&runtime, parent)? {
            Step::Cached(cached) => return cached,
            Step::InFlight => return Err(self.in_flight()),
            Step::Run(tracking) => tracking,
        };
        let result = match &self.inner.compute {
            Compute::Sync(compute) => {
                let cx = tracking.context().clone();
                run_body(runtime.config.catch_panics, || compute(&cx))
            }
            Compute::Async(_) => {
                return Err(ReactiveError::RequiresAsync {
                    node: self.inner.id,
                })
            }
        };
        self.store(tracking, result)
    }

    async fn evaluate_async(&self, parent: Option<&ReactiveContext>) -> Result<T, ReactiveError> {
        let runtime = self.runtime()?;
        let tracking = loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            match self.begin(&runtime, parent)? {
                Step::Cached(cached) => return cached,
                Step::Run(tracking) => break tracking,
                Step::InFlight if !self.is_async() => return Err(self.in_flight()),
                Step::InFlight => {
                    trace!(node = %self.inner.id, "waiting for in-flight evaluation");
                    tokio::select! {
                        _ = &mut settled => {}
                        _ = runtime.cancelled() => {
                            return Err(ReactiveError::Cancelled { node: self.inner.id });
                        }
                    }
                }
            }
        };
        let catch_panics = runtime.config.catch_panics;
        let result = match &self.inner.compute {
            Compute::Sync(compute) => {
                let cx = tracking.context().clone();
                run_body(catch_panics, || compute(&cx))
            }
            Compute::Async(compute) => {
                let body = compute(tracking.context().clone());
                tokio::select! {
                    result = run_async_body(catch_panics, body) => result,
                    _ = runtime.cancelled() => {
                        trace!(node = %self.inner.id, "calc evaluation cancelled");
                        return Err(ReactiveError::Cancelled { node: self.inner.id });
                    }
                }
            }
        };
        self.store(tracking, result)
    }

    fn store(&self, tracking: Tracking, result: Result<T, EvalError>) -> Result<T, ReactiveError> {
        let result = result.map_err(|err| err.into_reactive(self.inner.id));
        *self.inner.cache.lock() = Some(result.clone());
        self.inner.evaluations.fetch_add(1, Ordering::Relaxed);
        let stale = tracking.finish();
        trace!(node = %self.inner.id, ok = result.is_ok(), stale, "calc evaluated");
        result
    }
}

impl<T> Clone for Calc<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Calc<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calc")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("cached", &*self.inner.cache.lock())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    #[test]
    fn calc_computes_lazily() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(10);
        let doubled = runtime.declare_calc({
            let cell = cell.clone();
            move |cx| Ok(cell.read(cx)? * 2)
        });

        assert_eq!(doubled.evaluation_count(), 0);
        assert!(!doubled.has_value());
        assert_eq!(doubled.get().unwrap(), 20);
        assert_eq!(doubled.evaluation_count(), 1);
        assert!(doubled.is_valid());
    }

    #[test]
    fn calc_caches_until_invalidated() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(1);
        let calc = runtime.declare_calc({
            let cell = cell.clone();
            move |cx| Ok(cell.read(cx)? + 1)
        });

        assert_eq!(calc.get().unwrap(), 2);
        assert_eq!(calc.get().unwrap(), 2);
        assert_eq!(calc.evaluation_count(), 1);

        cell.write(5).unwrap();
        assert!(!calc.is_valid());
        assert_eq!(calc.get().unwrap(), 6);
        assert_eq!(calc.evaluation_count(), 2);

        calc.invalidate();
        assert_eq!(calc.get().unwrap(), 6);
        assert_eq!(calc.evaluation_count(), 3);
    }

    #[test]
    fn nested_calcs_register_only_themselves() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(3);
        let inner = runtime.declare_calc({
            let cell = cell.clone();
            move |cx| Ok(cell.read(cx)? * 2)
        });
        let outer = runtime.declare_calc({
            let inner = inner.clone();
            move |cx| Ok(inner.read(cx)? + 1)
        });

        assert_eq!(outer.get().unwrap(), 7);
        assert_eq!(outer.dependency_count(), 1);
        assert_eq!(inner.dependency_count(), 1);
        assert_eq!(cell.dependent_count(), 1);

        cell.write(4).unwrap();
        assert!(!outer.is_valid());
        assert_eq!(outer.get().unwrap(), 9);
    }

    #[test]
    fn failures_are_cached_until_invalidated() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let checked = runtime.declare_calc({
            let cell = cell.clone();
            move |cx| {
                let value = cell.read(cx)?;
                if value == 0 {
                    return Err(EvalError::msg("division by zero"));
                }
                Ok(100 / value)
            }
        });

        let first = checked.get().unwrap_err();
        let second = checked.get().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(checked.evaluation_count(), 1);
        assert_eq!(first.node(), Some(checked.id()));

        cell.write(4).unwrap();
        assert_eq!(checked.get().unwrap(), 25);
    }

    #[test]
    fn upstream_errors_propagate_verbatim() {
        let runtime = Runtime::new();
        let failing = runtime.declare_calc::<i32, _>(|_| Err(EvalError::msg("boom")));
        let downstream = runtime.declare_calc({
            let failing = failing.clone();
            move |cx| Ok(failing.read(cx)? + 1)
        });

        let err = downstream.get().unwrap_err();
        assert!(matches!(
            &err,
            ReactiveError::Evaluation { node, .. } if *node == failing.id()
        ));
        assert_eq!(err.to_string(), failing.get().unwrap_err().to_string());
    }

    #[test]
    fn panics_are_cached_as_errors() {
        let runtime = Runtime::new();
        let calc = runtime.declare_calc::<i32, _>(|_| panic!("bad input"));

        let err = calc.get().unwrap_err();
        assert!(matches!(
            err,
            ReactiveError::Evaluation {
                source: EvalError::Panicked(_),
                ..
            }
        ));
        assert!(calc.get().is_err());
        assert_eq!(calc.evaluation_count(), 1);
    }

    #[test]
    fn dependencies_are_pruned_to_the_last_run() {
        let runtime = Runtime::new();
        let flag = runtime.new_cell(true);
        let a = runtime.new_cell("a");
        let b = runtime.new_cell("b");
        let pick = runtime.declare_calc({
            let (flag, a, b) = (flag.clone(), a.clone(), b.clone());
            move |cx| {
                if flag.read(cx)? {
                    Ok(a.read(cx)?)
                } else {
                    Ok(b.read(cx)?)
                }
            }
        });

        assert_eq!(pick.get().unwrap(), "a");
        assert_eq!(a.dependent_count(), 1);

        flag.write(false).unwrap();
        assert_eq!(pick.get().unwrap(), "b");
        assert_eq!(a.dependent_count(), 0);
        assert_eq!(b.dependent_count(), 1);

        // The pruned branch no longer invalidates the calc.
        a.write("a2").unwrap();
        assert!(pick.is_valid());
    }

    #[test]
    fn self_reading_calc_reports_a_cycle() {
        let runtime = Runtime::new();
        let slot: Arc<OnceLock<Calc<i32>>> = Arc::new(OnceLock::new());
        let calc = runtime.declare_calc({
            let slot = slot.clone();
            move |cx| match slot.get() {
                Some(me) => Ok(me.read(cx)? + 1),
                None => Ok(0),
            }
        });
        assert!(slot.set(calc.clone()).is_ok());

        let err = calc.get().unwrap_err();
        assert!(err.is_cycle());
        assert!(matches!(
            err,
            ReactiveError::Cycle { ref path } if path == &vec![calc.id(), calc.id()]
        ));
    }

    #[test]
    fn breaking_a_cycle_upstream_recovers_both_calcs() {
        let runtime = Runtime::new();
        let flag = runtime.new_cell(true);
        let slot: Arc<OnceLock<Calc<i32>>> = Arc::new(OnceLock::new());
        let a = runtime.declare_calc({
            let (flag, slot) = (flag.clone(), slot.clone());
            move |cx| {
                if flag.read(cx)? {
                    if let Some(b) = slot.get() {
                        return Ok(b.read(cx)? + 1);
                    }
                }
                Ok(1)
            }
        });
        let b = runtime.declare_calc({
            let a = a.clone();
            move |cx| Ok(a.read(cx)? + 1)
        });
        assert!(slot.set(b.clone()).is_ok());

        assert!(a.get().unwrap_err().is_cycle());
        assert!(b.get().unwrap_err().is_cycle());
        assert_eq!(b.dependency_count(), 1);

        flag.write(false).unwrap();
        assert!(!a.is_valid());
        assert!(!b.is_valid());
        assert_eq!(a.get().unwrap(), 1);
        assert_eq!(b.get().unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_async_evaluation() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(5);
        let slow = runtime.declare_async_calc({
            let cell = cell.clone();
            move |cx| {
                let cell = cell.clone();
                async move {
                    tokio::task::yield_now().await;
                    Ok::<_, EvalError>(cell.read(&cx)?)
                }
            }
        });

        let (first, second) = tokio::join!(slow.get_async(), slow.get_async());
        assert_eq!(first.unwrap(), 5);
        assert_eq!(second.unwrap(), 5);
        assert_eq!(slow.evaluation_count(), 1);
    }

    #[test]
    fn sync_read_of_pending_async_calc_is_refused() {
        let runtime = Runtime::new();
        let calc = runtime.declare_async_calc(|_| async { Ok::<_, EvalError>(1) });
        assert!(calc.is_async());
        assert!(matches!(
            calc.get(),
            Err(ReactiveError::RequiresAsync { node }) if node == calc.id()
        ));
        assert!(!calc.has_value());
        assert_eq!(calc.state(), NodeState::Invalid);
    }

    #[tokio::test]
    async fn async_calc_tracks_reads_across_awaits() {
        let runtime = Runtime::new();
        let a = runtime.new_cell(1);
        let b = runtime.new_cell(2);
        let sum = runtime.declare_async_calc({
            let (a, b) = (a.clone(), b.clone());
            move |cx| {
                let (a, b) = (a.clone(), b.clone());
                async move {
                    let first = a.read(&cx)?;
                    tokio::task::yield_now().await;
                    Ok::<_, EvalError>(first + b.read(&cx)?)
                }
            }
        });

        assert_eq!(sum.get_async().await.unwrap(), 3);
        assert_eq!(sum.dependency_count(), 2);
        // Valid now, so a synchronous read is served from the cache.
        assert_eq!(sum.get().unwrap(), 3);

        b.write(10).unwrap();
        assert_eq!(sum.get_async().await.unwrap(), 11);
    }

    #[test]
    fn reads_after_teardown_are_stale() {
        let runtime = Runtime::new();
        let calc = runtime.declare_calc(|_| Ok(1));
        assert_eq!(calc.get().unwrap(), 1);

        runtime.teardown();
        assert!(matches!(
            calc.get(),
            Err(ReactiveError::StaleRead { .. })
        ));
    }
}
