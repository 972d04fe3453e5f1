//! Effect Implementation
//!
//! An Effect is a side-effecting computation that re-runs whenever one of
//! its dependencies changes.
//!
//! # How Effects Work
//!
//! 1. When declared, the effect is registered invalid and queued, so the
//!    first flush runs it and establishes its dependencies.
//!
//! 2. When any dependency changes, the effect is queued. However many times
//!    it is invalidated before the flush reaches it, it runs once.
//!
//! 3. Every run happens in a fresh tracking frame; the dependency set is
//!    replaced by what that run read.
//!
//! # Failures
//!
//! A failing run is reported to the runtime's `on_error` hooks and the
//! effect sits out the rest of the flush. Other effects are unaffected. If
//! it is invalidated again meanwhile, it runs on the next flush.
//!
//! # Differences from Calc
//!
//! - Calcs return a value; effects do not.
//! - Calcs are lazy (compute on read); effects are eager (run on flush).
//! - Calcs cache results; effects just run their side effect.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::trace;

use super::context::{Begin, ReactiveContext, Tracking};
use super::runtime::{run_async_body, run_body, Runtime, RuntimeInner};
use crate::error::{EvalError, ReactiveError};
use crate::graph::{Node, NodeId};

type SyncBody = Box<dyn Fn(&ReactiveContext) -> Result<(), EvalError> + Send + Sync>;
type AsyncBody =
    Box<dyn Fn(ReactiveContext) -> BoxFuture<'static, Result<(), EvalError>> + Send + Sync>;

enum Body {
    Sync(SyncBody),
    Async(AsyncBody),
}

/// Scheduling options for a new effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectOptions {
    /// Higher priorities run first within a pass. Equal priorities run in
    /// the order they were queued.
    pub priority: i32,

    /// Start suspended. The first run happens after `resume`.
    pub suspended: bool,
}

/// A side-effecting computation that re-runs when its dependencies change.
///
/// The runtime keeps the effect alive; dropping the handle does not stop it.
/// Use [`dispose`](Self::dispose) for that.
///
/// # Example
///
/// ```rust
/// use reactor_core::reactive::Runtime;
///
/// # let executor = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// # executor.block_on(async {
/// let runtime = Runtime::new();
/// let count = runtime.new_cell(0);
///
/// let effect = runtime.declare_effect({
///     let count = count.clone();
///     move |cx| {
///         println!("count is {}", count.read(cx)?);
///         Ok(())
///     }
/// });
///
/// runtime.flush().await.unwrap(); // prints "count is 0"
/// count.write(5).unwrap();
/// runtime.flush().await.unwrap(); // prints "count is 5"
/// assert_eq!(effect.run_count(), 2);
/// # });
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
}

pub(crate) struct EffectInner {
    id: NodeId,
    runtime: Weak<RuntimeInner>,
    body: Body,
    runs: AtomicUsize,
    disposed: AtomicBool,
}

impl EffectInner {
    /// Run the body once, inside a fresh frame.
    pub(crate) async fn run(&self, runtime: &Arc<RuntimeInner>) -> Result<(), ReactiveError> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let Begin::Run(tracking) = Tracking::begin(runtime, self.id, None)? else {
            return Ok(());
        };

        let catch_panics = runtime.config.catch_panics;
        let result = match &self.body {
            Body::Sync(body) => {
                let cx = tracking.context().clone();
                run_body(catch_panics, || body(&cx))
            }
            Body::Async(body) => {
                let body = body(tracking.context().clone());
                tokio::select! {
                    result = run_async_body(catch_panics, body) => result,
                    _ = runtime.cancelled() => {
                        trace!(node = %self.id, "effect run cancelled");
                        return Err(ReactiveError::Cancelled { node: self.id });
                    }
                }
            }
        };

        // A failed run still completed: what it read before failing is its
        // dependency set.
        let stale = tracking.finish();
        self.runs.fetch_add(1, Ordering::Relaxed);
        trace!(node = %self.id, ok = result.is_ok(), stale, "effect ran");
        result.map_err(|err| err.into_reactive(self.id))
    }
}

impl Runtime {
    /// Declare an effect. It first runs on the next flush.
    pub fn declare_effect<F>(&self, body: F) -> Effect
    where
        F: Fn(&ReactiveContext) -> Result<(), EvalError> + Send + Sync + 'static,
    {
        self.declare_effect_with(EffectOptions::default(), body)
    }

    pub fn declare_effect_with<F>(&self, options: EffectOptions, body: F) -> Effect
    where
        F: Fn(&ReactiveContext) -> Result<(), EvalError> + Send + Sync + 'static,
    {
        self.register_effect(options, Body::Sync(Box::new(body)))
    }

    /// Declare an effect whose body may suspend.
    pub fn declare_async_effect<F, Fut>(&self, body: F) -> Effect
    where
        F: Fn(ReactiveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EvalError>> + Send + 'static,
    {
        self.declare_async_effect_with(EffectOptions::default(), body)
    }

    pub fn declare_async_effect_with<F, Fut>(&self, options: EffectOptions, body: F) -> Effect
    where
        F: Fn(ReactiveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EvalError>> + Send + 'static,
    {
        self.register_effect(
            options,
            Body::Async(Box::new(move |cx| body(cx).boxed())),
        )
    }

    fn register_effect(&self, options: EffectOptions, body: Body) -> Effect {
        let mut node = Node::effect();
        node.set_priority(options.priority);
        node.set_suspended(options.suspended);
        let id = node.id();

        let inner = Arc::new(EffectInner {
            id,
            runtime: self.downgrade(),
            body,
            runs: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        });
        self.inner().effects.lock().insert(id, Arc::clone(&inner));
        self.inner().add_node(node);
        trace!(node = %id, priority = options.priority, "effect declared");
        Effect { inner }
    }
}

impl Effect {
    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Queue the effect as if one of its dependencies changed.
    pub fn invalidate(&self) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.invalidate(self.inner.id);
        }
    }

    /// Stop the effect permanently and release its node.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(runtime) = self.inner.runtime.upgrade() else {
            return;
        };
        let removed = runtime.effects.lock().remove(&self.inner.id);
        runtime.graph.lock().remove_node(self.inner.id);
        drop(removed);
        trace!(node = %self.inner.id, "effect disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Hold the effect. Invalidations while suspended are remembered and
    /// the effect runs once after [`resume`](Self::resume).
    pub fn suspend(&self) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.graph.lock().suspend(self.inner.id);
        }
    }

    pub fn resume(&self) {
        let Some(runtime) = self.inner.runtime.upgrade() else {
            return;
        };
        let queued = runtime.graph.lock().resume(self.inner.id);
        if queued {
            runtime.notify_work();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.with_node(|node| node.is_suspended()).unwrap_or(false)
    }

    /// Change the priority used the next time the effect is queued.
    pub fn set_priority(&self, priority: i32) {
        if let Some(runtime) = self.inner.runtime.upgrade() {
            runtime.graph.lock().set_priority(self.inner.id, priority);
        }
    }

    /// Number of completed runs, failed ones included.
    pub fn run_count(&self) -> usize {
        self.inner.runs.load(Ordering::Relaxed)
    }

    pub fn dependency_count(&self) -> usize {
        self.with_node(|node| node.dependencies().len()).unwrap_or(0)
    }

    fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let runtime = self.inner.runtime.upgrade()?;
        let graph = runtime.graph.lock();
        let result = graph.get_node(self.inner.id).map(f);
        result
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn effect_runs_on_first_flush() {
        let runtime = Runtime::new();
        let effect = runtime.declare_effect(|_| Ok(()));
        assert_eq!(effect.run_count(), 0);
        assert!(runtime.has_pending_work());

        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 1);

        // Nothing changed, nothing runs.
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 1);
    }

    #[tokio::test]
    async fn effect_reruns_once_per_flush_when_dependencies_change() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let effect = runtime.declare_effect({
            let cell = cell.clone();
            let seen = seen.clone();
            move |cx| {
                seen.lock().push(cell.read(cx)?);
                Ok(())
            }
        });

        runtime.flush().await.unwrap();
        cell.write(1).unwrap();
        cell.write(2).unwrap();
        cell.write(3).unwrap();
        runtime.flush().await.unwrap();

        assert_eq!(*seen.lock(), vec![0, 3]);
        assert_eq!(effect.run_count(), 2);
        assert_eq!(effect.dependency_count(), 1);
    }

    #[tokio::test]
    async fn disposed_effects_stop_running() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let effect = runtime.declare_effect({
            let cell = cell.clone();
            move |cx| {
                cell.read(cx)?;
                Ok(())
            }
        });
        runtime.flush().await.unwrap();
        assert_eq!(cell.dependent_count(), 1);

        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(cell.dependent_count(), 0);

        cell.write(1).unwrap();
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 1);
    }

    #[tokio::test]
    async fn manual_invalidation_requeues_the_effect() {
        let runtime = Runtime::new();
        let effect = runtime.declare_effect(|_| Ok(()));
        runtime.flush().await.unwrap();

        effect.invalidate();
        effect.invalidate();
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[tokio::test]
    async fn suspended_effect_runs_once_after_resume() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let effect = runtime.declare_effect_with(
            EffectOptions {
                suspended: true,
                ..EffectOptions::default()
            },
            {
                let cell = cell.clone();
                move |cx| {
                    cell.read(cx)?;
                    Ok(())
                }
            },
        );
        assert!(effect.is_suspended());

        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 0);

        effect.resume();
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 1);

        effect.suspend();
        cell.write(1).unwrap();
        cell.write(2).unwrap();
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 1);

        effect.resume();
        runtime.flush().await.unwrap();
        assert_eq!(effect.run_count(), 2);
    }

    #[tokio::test]
    async fn failed_runs_keep_what_they_read() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(0);
        let effect = runtime.declare_effect({
            let cell = cell.clone();
            move |cx| {
                if cell.read(cx)? == 0 {
                    return Err(EvalError::msg("not ready"));
                }
                Ok(())
            }
        });

        let report = runtime.flush().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, effect.id());
        assert_eq!(effect.dependency_count(), 1);

        cell.write(1).unwrap();
        let report = runtime.flush().await.unwrap();
        assert!(report.errors.is_empty());
        assert_eq!(effect.run_count(), 2);
    }

    #[tokio::test]
    async fn async_effect_awaits_inside_its_frame() {
        let runtime = Runtime::new();
        let cell = runtime.new_cell(1);
        let total = Arc::new(Mutex::new(0));

        let effect = runtime.declare_async_effect({
            let cell = cell.clone();
            let total = total.clone();
            move |cx| {
                let cell = cell.clone();
                let total = total.clone();
                async move {
                    tokio::task::yield_now().await;
                    let value = cell.read(&cx)?;
                    *total.lock() += value;
                    Ok::<_, EvalError>(())
                }
            }
        });

        runtime.flush().await.unwrap();
        cell.write(4).unwrap();
        runtime.flush().await.unwrap();

        assert_eq!(*total.lock(), 5);
        assert_eq!(effect.dependency_count(), 1);
    }
}
