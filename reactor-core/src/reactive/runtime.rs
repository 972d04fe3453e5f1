//! Reactive Runtime
//!
//! The runtime is the per-session coordinator that connects cells, calcs and
//! effects. It owns the dependency graph and runs the flush loop.
//!
//! # How It Works
//!
//! 1. Cells, calcs and effects are created through a `Runtime` and register
//!    a node in its graph. Handles keep only a weak reference back.
//!
//! 2. When a body reads a node through its `ReactiveContext`, the edge is
//!    added to the graph immediately.
//!
//! 3. When a cell's value changes, the runtime:
//!    a. Marks dependent calcs invalid (they recompute on next read)
//!    b. Queues dependent effects
//!    c. Moves to `FlushState::Scheduled` and wakes the session loop
//!
//! 4. `flush` runs queued effects pass by pass until nothing is left,
//!    calling the `on_flushed` hooks after each pass.
//!
//! # Thread Safety
//!
//! Handles are `Send + Sync`, but a runtime expects a single logical flow of
//! control: the session loop serializes input and flushes. No lock is held
//! while user code runs, so bodies are free to read and write other nodes.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use super::context::{ReactiveContext, StopOnDrop};
use super::effect::EffectInner;
use crate::config::RuntimeConfig;
use crate::error::{EvalError, ReactiveError};
use crate::graph::{FlushState, Node, NodeId, UpdateScheduler};

type FlushedHook = Arc<dyn Fn(&PassSummary) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(NodeId, &ReactiveError) + Send + Sync>;

/// Identifies a registered hook so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Summary handed to `on_flushed` hooks after each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// 1-based index of the pass within its flush.
    pub pass: usize,
    pub effects_run: usize,
    pub errors: usize,
}

/// Result of one call to [`Runtime::flush`].
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    pub passes: usize,
    pub effects_run: usize,
    /// Effect failures, in the order they happened.
    pub errors: Vec<(NodeId, ReactiveError)>,
}

impl FlushReport {
    /// True if the call found nothing to flush.
    pub fn is_noop(&self) -> bool {
        self.passes == 0
    }
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    flushed: Vec<(HookId, FlushedHook, bool)>,
    errors: Vec<(HookId, ErrorHook)>,
}

impl Hooks {
    fn next_id(&mut self) -> HookId {
        self.next_id += 1;
        HookId(self.next_id)
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) graph: Mutex<UpdateScheduler>,
    pub(crate) effects: Mutex<HashMap<NodeId, Arc<EffectInner>>>,
    hooks: Mutex<Hooks>,
    closed: watch::Sender<bool>,
    wake: Notify,
}

impl RuntimeInner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Resolves once the runtime has been torn down.
    pub(crate) async fn cancelled(&self) {
        wait_closed(self.closed_receiver()).await
    }

    pub(crate) fn add_node(&self, node: Node) -> NodeId {
        let id = self.graph.lock().add_node(node);
        self.wake.notify_one();
        id
    }

    /// Called when the last handle to a cell or calc is dropped.
    pub(crate) fn release(&self, node: NodeId) {
        if self.is_closed() {
            return;
        }
        self.graph.lock().remove_node(node);
        trace!(%node, "node released");
    }

    pub(crate) fn mark_changed(&self, node: NodeId) {
        let queued = self.graph.lock().mark_changed(node);
        trace!(%node, queued, "cell changed");
        self.wake.notify_one();
    }

    pub(crate) fn invalidate(&self, node: NodeId) {
        let queued = self.graph.lock().invalidate(node);
        trace!(%node, queued, "node invalidated");
        self.wake.notify_one();
    }

    pub(crate) fn notify_work(&self) {
        self.wake.notify_one();
    }

    fn next_effect(&self) -> Option<(NodeId, Arc<EffectInner>)> {
        loop {
            let id = self.graph.lock().next_effect()?;
            if let Some(effect) = self.effects.lock().get(&id).cloned() {
                return Some((id, effect));
            }
        }
    }

    fn report_error(&self, node: NodeId, error: &ReactiveError) {
        warn!(%node, %error, "effect failed");
        let hooks: Vec<ErrorHook> = self
            .hooks
            .lock()
            .errors
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook(node, error);
        }
    }

    fn fire_flushed(&self, summary: &PassSummary) {
        let hooks: Vec<FlushedHook> = {
            let mut hooks = self.hooks.lock();
            let fired = hooks
                .flushed
                .iter()
                .map(|(_, hook, _)| Arc::clone(hook))
                .collect();
            hooks.flushed.retain(|(_, _, once)| !once);
            fired
        };
        for hook in hooks {
            hook(summary);
        }
    }
}

/// Resolves when the runtime behind `closed` is torn down or dropped.
pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// Run a synchronous body, turning panics into evaluation errors if enabled.
pub(crate) fn run_body<T>(
    catch_panics: bool,
    body: impl FnOnce() -> Result<T, EvalError>,
) -> Result<T, EvalError> {
    if !catch_panics {
        return body();
    }
    std::panic::catch_unwind(AssertUnwindSafe(body))
        .unwrap_or_else(|payload| Err(EvalError::from_panic(payload)))
}

/// Async counterpart of [`run_body`].
pub(crate) async fn run_async_body<T>(
    catch_panics: bool,
    body: BoxFuture<'static, Result<T, EvalError>>,
) -> Result<T, EvalError> {
    if !catch_panics {
        return body.await;
    }
    AssertUnwindSafe(body)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(EvalError::from_panic(payload)))
}

/// Returns the flush state machine to rest on every exit from `flush`.
struct FlushGuard<'a> {
    runtime: &'a RuntimeInner,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.runtime.graph.lock().end_flush();
    }
}

/// Handle to one session's reactive runtime.
///
/// Cloning is cheap and every clone refers to the same graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                graph: Mutex::new(UpdateScheduler::new()),
                effects: Mutex::new(HashMap::new()),
                hooks: Mutex::new(Hooks::default()),
                closed,
                wake: Notify::new(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Run `f` inside a fresh tracking frame and return what it read.
    ///
    /// The frame has no owning node, so no edges are recorded; this is the
    /// building block for callers that want to know a computation's inputs
    /// without making it reactive.
    pub fn with_tracking<R>(&self, f: impl FnOnce(&ReactiveContext) -> R) -> (R, IndexSet<NodeId>) {
        let cx = ReactiveContext::new(&self.inner, None, None);
        let result = {
            let _stop = StopOnDrop(&cx);
            f(&cx)
        };
        (result, cx.close())
    }

    /// Drain the invalidation queue.
    ///
    /// Runs every queued effect once per pass, in priority then FIFO order,
    /// and calls the `on_flushed` hooks after each pass. Effects invalidated
    /// after they already ran in a pass run again in the next one. Returns
    /// immediately with an empty report if nothing is pending or a flush is
    /// already in progress.
    pub async fn flush(&self) -> Result<FlushReport, ReactiveError> {
        let inner = &*self.inner;
        if inner.is_closed() {
            return Err(ReactiveError::SessionClosed);
        }
        if !inner.graph.lock().begin_flush() {
            return Ok(FlushReport::default());
        }
        let _flushing = FlushGuard { runtime: inner };
        let mut report = FlushReport::default();

        loop {
            report.passes += 1;
            if report.passes > inner.config.max_flush_passes {
                warn!(
                    limit = inner.config.max_flush_passes,
                    "flush aborted: effects keep invalidating each other"
                );
                return Err(ReactiveError::FlushLimit {
                    passes: inner.config.max_flush_passes,
                });
            }

            let mut summary = PassSummary {
                pass: report.passes,
                ..PassSummary::default()
            };
            while let Some((id, effect)) = inner.next_effect() {
                summary.effects_run += 1;
                match effect.run(&self.inner).await {
                    Ok(()) => {}
                    Err(err @ ReactiveError::Cancelled { .. }) => return Err(err),
                    Err(err) => {
                        inner.graph.lock().mark_failed(id);
                        inner.report_error(id, &err);
                        summary.errors += 1;
                        report.errors.push((id, err));
                    }
                }
            }
            report.effects_run += summary.effects_run;
            debug!(
                pass = summary.pass,
                effects = summary.effects_run,
                errors = summary.errors,
                "flush pass complete"
            );

            inner.fire_flushed(&summary);
            if inner.is_closed() {
                return Err(ReactiveError::SessionClosed);
            }
            if !inner.graph.lock().advance_pass() {
                break;
            }
        }
        Ok(report)
    }

    pub fn state(&self) -> FlushState {
        self.inner.graph.lock().state()
    }

    /// True if a write or invalidation is waiting for a flush.
    pub fn has_pending_work(&self) -> bool {
        self.inner.graph.lock().has_pending_work()
    }

    /// Resolves the next time a write, invalidation or new effect makes
    /// work available. A notification that arrived while nobody was waiting
    /// is delivered to the next caller.
    pub async fn work_available(&self) {
        self.inner.wake.notified().await
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.lock().node_count()
    }

    /// Call `hook` after every completed flush pass.
    pub fn on_flushed<F>(&self, hook: F) -> HookId
    where
        F: Fn(&PassSummary) + Send + Sync + 'static,
    {
        self.add_flushed(Arc::new(hook), false)
    }

    /// Call `hook` after the next completed flush pass only.
    pub fn on_flushed_once<F>(&self, hook: F) -> HookId
    where
        F: Fn(&PassSummary) + Send + Sync + 'static,
    {
        self.add_flushed(Arc::new(hook), true)
    }

    fn add_flushed(&self, hook: FlushedHook, once: bool) -> HookId {
        let mut hooks = self.inner.hooks.lock();
        let id = hooks.next_id();
        hooks.flushed.push((id, hook, once));
        id
    }

    /// Receive every effect failure. This is the session's error channel.
    pub fn on_error<F>(&self, hook: F) -> HookId
    where
        F: Fn(NodeId, &ReactiveError) + Send + Sync + 'static,
    {
        let mut hooks = self.inner.hooks.lock();
        let id = hooks.next_id();
        hooks.errors.push((id, Arc::new(hook)));
        id
    }

    /// Unregister a hook. Returns false if it was already gone.
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut hooks = self.inner.hooks.lock();
        let before = hooks.flushed.len() + hooks.errors.len();
        hooks.flushed.retain(|(hook_id, _, _)| *hook_id != id);
        hooks.errors.retain(|(hook_id, _)| *hook_id != id);
        before != hooks.flushed.len() + hooks.errors.len()
    }

    /// Tear the session down.
    ///
    /// Pending work is dropped, every effect is released and every later
    /// read of this runtime's nodes fails with `StaleRead`. In-flight async
    /// evaluations are cancelled at their next suspension point.
    pub fn teardown(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        let effects = std::mem::take(&mut *self.inner.effects.lock());
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        self.inner.graph.lock().clear();
        debug!(effects = effects.len(), "runtime torn down");
        // Dropping effect bodies can drop the last handle to other nodes,
        // which takes the graph lock again.
        drop(effects);
        drop(hooks);
        self.inner.wake.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Resolves once the runtime has been torn down.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("node_count", &self.node_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
