//! Reactor Core
//!
//! This crate provides the reactive core of a server-side reactive web
//! framework: every connected client gets a session whose state lives in
//! cells, whose derived values live in calcs, and whose outputs are pushed
//! by effects. It implements:
//!
//! - Reactive primitives (cells, calcs, effects)
//! - Explicit dependency tracking through `ReactiveContext` frames
//! - The invalidation queue and multi-pass flush loop
//! - Per-session event loops and a session registry
//!
//! The crate is designed to be used both as a native Rust library and, with
//! the `python` feature, as a Python extension module via PyO3.
//!
//! # Architecture
//!
//! - `reactive`: Cells, calcs, effects and the per-session `Runtime`
//! - `graph`: Dependency graph, invalidation queue and flush state machine
//! - `session`: Session event loop and registry
//! - `error`, `config`: Error taxonomy and runtime configuration
//!
//! # Example
//!
//! ```rust
//! use reactor_core::reactive::Runtime;
//!
//! # let executor = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # executor.block_on(async {
//! let runtime = Runtime::new();
//!
//! // Create a cell
//! let count = runtime.new_cell(0);
//!
//! // Create a derived value
//! let doubled = runtime.declare_calc({
//!     let count = count.clone();
//!     move |cx| Ok(count.read(cx)? * 2)
//! });
//!
//! // Create an effect
//! runtime.declare_effect({
//!     let (count, doubled) = (count.clone(), doubled.clone());
//!     move |cx| {
//!         println!("Count: {}, Doubled: {}", count.read(cx)?, doubled.read(cx)?);
//!         Ok(())
//!     }
//! });
//!
//! runtime.flush().await.unwrap(); // prints "Count: 0, Doubled: 0"
//!
//! // Update the cell
//! count.write(5).unwrap();
//! runtime.flush().await.unwrap(); // prints "Count: 5, Doubled: 10"
//! # });
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod session;

#[cfg(feature = "python")]
mod python;

pub use config::{ConfigError, RuntimeConfig};
pub use error::{EvalError, ReactiveError};
pub use graph::{FlushState, NodeId};
pub use reactive::{
    Calc, Cell, Effect, EffectOptions, FlushReport, ReactiveContext, Runtime, WritePolicy,
};
pub use session::{Session, SessionId, SessionLoop, SessionRegistry};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module definition.
///
/// This function is called by Python when importing the module.
/// It registers all Python-exposed types.
#[cfg(feature = "python")]
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::PyRuntime>()?;
    m.add_class::<python::PyContext>()?;
    m.add_class::<python::PyCell>()?;
    m.add_class::<python::PyCalc>()?;
    m.add_class::<python::PyEffect>()?;

    // Add version info
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;

    Ok(())
}
