//! Error types for the reactive core.
//!
//! `ReactiveError` is `Clone` because a calc caches its failure and hands the
//! same error back on every read until it is invalidated.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::graph::NodeId;

/// Errors raised by cells, calcs, effects and the flush loop.
#[derive(Debug, Clone, Error)]
pub enum ReactiveError {
    /// A node read itself, directly or through other nodes, while evaluating.
    #[error("dependency cycle detected: {}", format_path(path))]
    Cycle {
        /// The evaluation path, outermost first, ending with the re-entered node.
        path: Vec<NodeId>,
    },

    /// The body of a calc or effect failed.
    #[error("evaluation of {node} failed: {source}")]
    Evaluation {
        node: NodeId,
        #[source]
        source: EvalError,
    },

    /// The node's session has been torn down, or the node was released.
    #[error("{node} belongs to a session that has been torn down")]
    StaleRead { node: NodeId },

    /// An in-flight evaluation was abandoned because its session closed.
    #[error("evaluation of {node} was cancelled")]
    Cancelled { node: NodeId },

    /// An async calc needs evaluation but was read synchronously.
    #[error("{node} has an async body and must be read with `get_async`/`read_async`")]
    RequiresAsync { node: NodeId },

    /// A node was read through a tracking frame owned by another session.
    #[error("{node} cannot be read from another session's tracking frame")]
    ForeignSession { node: NodeId },

    /// Effects kept invalidating each other past the configured pass limit.
    #[error("flush did not settle after {passes} passes")]
    FlushLimit { passes: usize },

    /// The session no longer accepts input.
    #[error("session is closed")]
    SessionClosed,

    /// Timer-based invalidation was requested outside a tokio runtime.
    #[error("no tokio runtime available to schedule a delayed invalidation")]
    NoExecutor,
}

impl ReactiveError {
    /// Returns true if this error, or the error it wraps, is a dependency cycle.
    pub fn is_cycle(&self) -> bool {
        match self {
            Self::Cycle { .. } => true,
            Self::Evaluation {
                source: EvalError::Upstream(inner),
                ..
            } => inner.is_cycle(),
            _ => false,
        }
    }

    /// The node the error is attributed to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Self::Cycle { path } => path.last().copied(),
            Self::Evaluation { node, .. }
            | Self::StaleRead { node }
            | Self::Cancelled { node }
            | Self::RequiresAsync { node }
            | Self::ForeignSession { node } => Some(*node),
            Self::FlushLimit { .. } | Self::SessionClosed | Self::NoExecutor => None,
        }
    }
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// The failure type returned by calc and effect bodies.
///
/// Reading another node with `?` inside a body converts its `ReactiveError`
/// into `EvalError::Upstream`; the runtime caches upstream errors unchanged
/// so a failure surfaces identically through every reader.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("{0}")]
    Message(Arc<str>),

    #[error("panicked: {0}")]
    Panicked(Arc<str>),

    #[error(transparent)]
    Upstream(Box<ReactiveError>),
}

impl EvalError {
    pub fn msg(message: impl Into<Arc<str>>) -> Self {
        Self::Message(message.into())
    }

    /// Captures the display text of any error.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::Message(error.to_string().into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).into()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str().into()
        } else {
            "non-string panic payload".into()
        };
        Self::Panicked(message)
    }

    /// Attributes this failure to `node`.
    pub(crate) fn into_reactive(self, node: NodeId) -> ReactiveError {
        match self {
            Self::Upstream(inner) => *inner,
            source => ReactiveError::Evaluation { node, source },
        }
    }
}

impl From<ReactiveError> for EvalError {
    fn from(error: ReactiveError) -> Self {
        Self::Upstream(Box::new(error))
    }
}

impl From<&str> for EvalError {
    fn from(message: &str) -> Self {
        Self::Message(message.into())
    }
}

impl From<String> for EvalError {
    fn from(message: String) -> Self {
        Self::Message(message.into())
    }
}
