//! Session Boundary
//!
//! A session is one connected client's reactive world: its own runtime,
//! graph and invalidation queue. Nothing is shared between sessions.
//!
//! # Event Loop
//!
//! Each session is driven by a single `SessionLoop` task, which is the one
//! logical flow of control for that session. The transport layer never
//! touches the graph directly; it hands closures to `Session::request_flush`
//! and the loop runs them in order. After a batch of input, or whenever a
//! timer or resumed effect makes work available, the loop flushes.
//!
//! ```text
//! transport ──request_flush(action)──▶ mpsc ──▶ SessionLoop
//!                                                 │ run actions
//!                                                 │ flush()
//!                                                 ▼
//!                                        effects push output
//! ```
//!
//! Closing a session tears its runtime down: pending flushes are dropped,
//! in-flight async evaluations are cancelled and every handle into the
//! session starts failing with `StaleRead`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::ReactiveError;
use crate::reactive::Runtime;

/// Input from the transport layer, run on the session loop.
pub type Action = Box<dyn FnOnce() + Send>;

/// Counter for generating unique session IDs.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Handle used by the transport layer to feed a session.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    runtime: Runtime,
    actions: mpsc::UnboundedSender<Action>,
}

/// The task side of a session. Consumed by [`SessionLoop::run`].
pub struct SessionLoop {
    id: SessionId,
    runtime: Runtime,
    actions: mpsc::UnboundedReceiver<Action>,
}

enum Wake {
    Closed,
    Input(Option<Action>),
    Work,
}

impl Session {
    /// Create a session and the loop that drives it. The caller decides
    /// where the loop runs.
    pub fn new(config: RuntimeConfig) -> (Session, SessionLoop) {
        let id = SessionId::next();
        let runtime = Runtime::with_config(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session {
            id,
            runtime: runtime.clone(),
            actions: tx,
        };
        let event_loop = SessionLoop {
            id,
            runtime,
            actions: rx,
        };
        (session, event_loop)
    }

    /// Create a session and spawn its loop on the current tokio runtime.
    pub fn spawn(config: RuntimeConfig) -> Result<(Session, JoinHandle<()>), ReactiveError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ReactiveError::NoExecutor)?;
        let (session, event_loop) = Session::new(config);
        let task = handle.spawn(event_loop.run());
        Ok((session, task))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's runtime, for declaring cells, calcs and effects.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Queue `action` (typically a batch of cell writes from the client) to
    /// run on the session loop, followed by a flush.
    pub fn request_flush<F>(&self, action: F) -> Result<(), ReactiveError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.runtime.is_closed() {
            return Err(ReactiveError::SessionClosed);
        }
        self.actions
            .send(Box::new(action))
            .map_err(|_| ReactiveError::SessionClosed)
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        if !self.runtime.is_closed() {
            debug!(session = %self.id, "closing session");
        }
        self.runtime.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.runtime.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionLoop {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Run the session until it is closed or every `Session` handle is
    /// dropped. The runtime is torn down on exit either way.
    pub async fn run(mut self) {
        debug!(session = %self.id, "session loop started");
        loop {
            let wake = tokio::select! {
                biased;
                _ = self.runtime.cancelled() => Wake::Closed,
                action = self.actions.recv() => Wake::Input(action),
                _ = self.runtime.work_available() => Wake::Work,
            };
            match wake {
                Wake::Closed | Wake::Input(None) => break,
                Wake::Input(Some(action)) => {
                    self.apply(action);
                    while let Ok(action) = self.actions.try_recv() {
                        self.apply(action);
                    }
                }
                Wake::Work => {}
            }

            if !self.runtime.has_pending_work() {
                continue;
            }
            match self.runtime.flush().await {
                Ok(report) => {
                    if !report.is_noop() {
                        debug!(
                            session = %self.id,
                            passes = report.passes,
                            effects = report.effects_run,
                            errors = report.errors.len(),
                            "session flushed"
                        );
                    }
                }
                Err(ReactiveError::SessionClosed | ReactiveError::Cancelled { .. }) => break,
                Err(error) => warn!(session = %self.id, %error, "flush failed"),
            }
        }
        self.runtime.teardown();
        debug!(session = %self.id, "session loop stopped");
    }

    fn apply(&self, action: Action) {
        if !self.runtime.config().catch_panics {
            action();
            return;
        }
        if std::panic::catch_unwind(AssertUnwindSafe(action)).is_err() {
            warn!(session = %self.id, "input action panicked");
        }
    }
}

/// Tracks the live sessions of one server.
///
/// Every session gets its own runtime; the registry only maps ids to
/// handles so the transport layer can route incoming messages.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionId, Session>>,
    config: RuntimeConfig,
}

impl SessionRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Open a session and spawn its loop on the current tokio runtime. The
    /// session leaves the registry when its loop stops.
    pub fn open(&self) -> Result<Session, ReactiveError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| ReactiveError::NoExecutor)?;
        let (session, event_loop) = Session::new(self.config.clone());
        let id = session.id();
        self.sessions.insert(id, session.clone());

        let sessions = Arc::clone(&self.sessions);
        handle.spawn(async move {
            event_loop.run().await;
            sessions.remove(&id);
        });
        debug!(session = %id, live = self.sessions.len(), "session opened");
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Close and forget a session. Returns false if it was not registered.
    pub fn close(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close(id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
