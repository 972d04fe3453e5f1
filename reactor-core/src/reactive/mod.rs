//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, calcs and effects,
//! tied together by a per-session `Runtime`.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. When a cell is read through a
//! `ReactiveContext`, the reading calc or effect becomes a dependent. When
//! the cell is written, every dependent is invalidated.
//!
//! ## Calcs
//!
//! A Calc is a derived value that caches its result, including a failed
//! one. It re-evaluates only when read after one of its dependencies
//! changed.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that the flush loop re-runs
//! whenever its dependencies change. Effects push state out to the rest of
//! the application, such as re-rendering an output.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: every body receives the
//! `ReactiveContext` of its own evaluation and reads through it. There is no
//! thread-local "current observer", so a body may await and resume on
//! another thread without losing its frame, and two sessions on one thread
//! never see each other's frames.

mod calc;
mod cell;
mod context;
mod effect;
mod runtime;

pub use calc::Calc;
pub use cell::{Cell, WritePolicy};
pub use context::ReactiveContext;
pub use effect::{Effect, EffectOptions};
pub use runtime::{FlushReport, HookId, PassSummary, Runtime};
