//! Python Bindings
//!
//! Exposes a session runtime to the Python-authored UI layer. Values are
//! arbitrary Python objects; calc and effect bodies are Python callables
//! that receive a `Context` to read through.
//!
//! Only synchronous bodies are exposed. `Runtime.flush()` drives the flush
//! loop to completion on the calling thread.

use std::sync::Arc;

use futures_util::FutureExt;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::error::{EvalError, ReactiveError};
use crate::reactive::{Calc, Cell, Effect, ReactiveContext, Runtime};

/// A Python object shared between the graph and the interpreter.
///
/// Cloning does not touch the reference count, so values can be copied out
/// of cells without holding the GIL.
#[derive(Clone)]
struct PyValue(Arc<Py<PyAny>>);

impl PyValue {
    fn new(value: PyObject) -> Self {
        Self(Arc::new(value))
    }

    fn to_object(&self, py: Python<'_>) -> PyObject {
        self.0.clone_ref(py)
    }
}

fn to_py_err(err: ReactiveError) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

fn to_eval_error(err: PyErr) -> EvalError {
    EvalError::msg(err.to_string())
}

/// Call `func(context)` for a calc or effect body.
fn call_body(func: &PyObject, cx: &ReactiveContext) -> Result<PyObject, EvalError> {
    Python::with_gil(|py| {
        let context = Py::new(py, PyContext { cx: cx.clone() }).map_err(to_eval_error)?;
        func.call1(py, (context,)).map_err(to_eval_error)
    })
}

/// Python-exposed session runtime.
#[pyclass(name = "Runtime")]
pub struct PyRuntime {
    runtime: Runtime,
}

#[pymethods]
impl PyRuntime {
    #[new]
    fn new() -> Self {
        Self {
            runtime: Runtime::new(),
        }
    }

    /// Create a cell holding `value`.
    fn cell(&self, value: PyObject) -> PyCell {
        PyCell {
            cell: self.runtime.new_cell(PyValue::new(value)),
        }
    }

    /// Declare a calc. `func` is called with a `Context` and its result is
    /// cached until something it read changes.
    fn calc(&self, func: PyObject) -> PyCalc {
        let calc = self
            .runtime
            .declare_calc(move |cx| call_body(&func, cx).map(PyValue::new));
        PyCalc { calc }
    }

    /// Declare an effect. It first runs on the next `flush()`.
    fn effect(&self, func: PyObject) -> PyEffect {
        let effect = self
            .runtime
            .declare_effect(move |cx| call_body(&func, cx).map(|_| ()));
        PyEffect { effect }
    }

    /// Run the flush loop until it settles. Returns the number of effect
    /// runs.
    fn flush(&self) -> PyResult<usize> {
        match self.runtime.flush().now_or_never() {
            Some(Ok(report)) => Ok(report.effects_run),
            Some(Err(err)) => Err(to_py_err(err)),
            None => Err(PyRuntimeError::new_err(
                "flush suspended on an async body; drive it from the async API",
            )),
        }
    }

    fn has_pending_work(&self) -> bool {
        self.runtime.has_pending_work()
    }

    fn node_count(&self) -> usize {
        self.runtime.node_count()
    }

    /// Tear the runtime down. Later reads raise.
    fn teardown(&self) {
        self.runtime.teardown();
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.runtime)
    }
}

/// Python-exposed tracking frame, handed to calc and effect bodies.
#[pyclass(name = "Context")]
pub struct PyContext {
    cx: ReactiveContext,
}

#[pymethods]
impl PyContext {
    /// ID of the node being evaluated.
    #[getter]
    fn owner(&self) -> Option<u64> {
        self.cx.owner().map(|id| id.raw())
    }

    #[getter]
    fn is_open(&self) -> bool {
        self.cx.is_open()
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.cx)
    }
}

/// Python-exposed cell.
#[pyclass(name = "Cell")]
pub struct PyCell {
    cell: Cell<PyValue>,
}

#[pymethods]
impl PyCell {
    /// The current value, without registering a dependency.
    #[getter]
    fn value(&self, py: Python<'_>) -> PyResult<PyObject> {
        let value = self.cell.get().map_err(to_py_err)?;
        Ok(value.to_object(py))
    }

    #[setter]
    fn set_value(&self, value: PyObject) -> PyResult<()> {
        self.write(value)
    }

    /// Read the value and register it as a dependency of `ctx`.
    fn read(&self, py: Python<'_>, ctx: PyRef<'_, PyContext>) -> PyResult<PyObject> {
        let value = self.cell.read(&ctx.cx).map_err(to_py_err)?;
        Ok(value.to_object(py))
    }

    fn write(&self, value: PyObject) -> PyResult<()> {
        self.cell
            .write(PyValue::new(value))
            .map(|_| ())
            .map_err(to_py_err)
    }

    #[getter]
    fn id(&self) -> u64 {
        self.cell.id().raw()
    }

    #[getter]
    fn version(&self) -> u64 {
        self.cell.version()
    }

    fn dependent_count(&self) -> usize {
        self.cell.dependent_count()
    }

    fn __repr__(&self, py: Python<'_>) -> String {
        let repr = self
            .cell
            .get()
            .ok()
            .and_then(|value| value.0.bind(py).repr().ok().map(|r| r.to_string()))
            .unwrap_or_else(|| "?".to_string());
        format!(
            "Cell(id={}, value={}, version={})",
            self.cell.id().raw(),
            repr,
            self.cell.version()
        )
    }
}

/// Python-exposed calc.
#[pyclass(name = "Calc")]
pub struct PyCalc {
    calc: Calc<PyValue>,
}

#[pymethods]
impl PyCalc {
    /// The current value, recomputing if needed. Cached failures re-raise.
    fn get(&self, py: Python<'_>) -> PyResult<PyObject> {
        let value = self.calc.get().map_err(to_py_err)?;
        Ok(value.to_object(py))
    }

    /// Like `get`, and registers this calc as a dependency of `ctx`.
    fn read(&self, py: Python<'_>, ctx: PyRef<'_, PyContext>) -> PyResult<PyObject> {
        let value = self.calc.read(&ctx.cx).map_err(to_py_err)?;
        Ok(value.to_object(py))
    }

    fn invalidate(&self) {
        self.calc.invalidate();
    }

    #[getter]
    fn id(&self) -> u64 {
        self.calc.id().raw()
    }

    #[getter]
    fn is_valid(&self) -> bool {
        self.calc.is_valid()
    }

    fn evaluation_count(&self) -> usize {
        self.calc.evaluation_count()
    }
}

/// Python-exposed effect.
#[pyclass(name = "Effect")]
pub struct PyEffect {
    effect: Effect,
}

#[pymethods]
impl PyEffect {
    fn invalidate(&self) {
        self.effect.invalidate();
    }

    fn dispose(&self) {
        self.effect.dispose();
    }

    fn suspend(&self) {
        self.effect.suspend();
    }

    fn resume(&self) {
        self.effect.resume();
    }

    #[getter]
    fn id(&self) -> u64 {
        self.effect.id().raw()
    }

    #[getter]
    fn run_count(&self) -> usize {
        self.effect.run_count()
    }
}
