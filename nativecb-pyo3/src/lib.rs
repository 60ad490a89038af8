//! `nativecb` -- Thin PyO3 wrappers around `nativecb_core`.
//!
//! A Python callable is registered with [`register`], which returns a
//! `CallbackOwner`.  The owner is the only strong reference to the
//! callback: once Python collects it, the trampoline becomes eligible for
//! release and the background sweep frees it.  Dispatch releases the GIL
//! via `py.allow_threads()` and re-acquires it only to run the callable.

use std::sync::{Arc, OnceLock};

use pyo3::exceptions::{PyKeyError, PyRuntimeError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use nativecb_core::{
    Callback, CallbackRuntime, NativeCallbackError, NativeHandle, RuntimeConfig, SlotAllocator,
};

// ---------------------------------------------------------------------------
// Error conversion helper
// ---------------------------------------------------------------------------

fn to_py_err(e: NativeCallbackError) -> PyErr {
    match e {
        NativeCallbackError::NotFound(_) => PyKeyError::new_err(e.to_string()),
        _ => PyRuntimeError::new_err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Process-wide runtime
// ---------------------------------------------------------------------------

static RUNTIME: OnceLock<CallbackRuntime> = OnceLock::new();

fn runtime() -> &'static CallbackRuntime {
    RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
            log::warn!("nativecb: ignoring environment configuration: {e}");
            RuntimeConfig::default()
        });
        let allocator = Arc::new(SlotAllocator::new(config.max_trampolines));
        CallbackRuntime::with_allocator(config, allocator)
    })
}

// ---------------------------------------------------------------------------
// Python callable adapter
// ---------------------------------------------------------------------------

struct PyCallback {
    func: Py<PyAny>,
    label: String,
}

impl Callback for PyCallback {
    fn invoke(&self, args: &[u8]) -> nativecb_core::Result<Vec<u8>> {
        Python::with_gil(|py| {
            let result = self
                .func
                .call1(py, (PyBytes::new(py, args),))
                .map_err(|e| NativeCallbackError::InvocationError(e.to_string()))?;
            let result = result.bind(py);
            if result.is_none() {
                return Ok(Vec::new());
            }
            if let Ok(bytes) = result.downcast::<PyBytes>() {
                return Ok(bytes.as_bytes().to_vec());
            }
            result.extract::<Vec<u8>>().map_err(|e| {
                NativeCallbackError::InvocationError(format!(
                    "{} returned a non-bytes value: {e}",
                    self.label
                ))
            })
        })
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// CallbackOwner
// ---------------------------------------------------------------------------

/// Keeps a registered callable alive.  Dropping the last reference makes
/// its handle eligible for release.
#[pyclass(module = "nativecb", frozen)]
struct CallbackOwner {
    callback: parking_lot::Mutex<Option<Arc<dyn Callback>>>,
    handle: NativeHandle,
    label: String,
}

impl CallbackOwner {
    fn release_reference(&self) {
        let dropped = self.callback.lock().take();
        if dropped.is_some() {
            drop(dropped);
            if let Some(rt) = RUNTIME.get() {
                rt.notify_collected();
            }
        }
    }
}

#[pymethods]
impl CallbackOwner {
    /// Native handle to pass to foreign code.
    #[getter]
    fn handle(&self) -> u64 {
        self.handle.as_raw()
    }

    #[getter]
    fn label(&self) -> &str {
        &self.label
    }

    /// True while the owner still holds its callable.
    #[getter]
    fn alive(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Drop the callable now instead of waiting for collection.
    fn close(&self) {
        self.release_reference();
    }

    fn __repr__(&self) -> String {
        format!("CallbackOwner(label={:?}, handle={})", self.label, self.handle)
    }
}

impl Drop for CallbackOwner {
    fn drop(&mut self) {
        self.release_reference();
    }
}

// ---------------------------------------------------------------------------
// Registration / dispatch
// ---------------------------------------------------------------------------

/// Register a Python callable taking `bytes` and returning `bytes` or None.
#[pyfunction]
#[pyo3(signature = (func, label=None))]
fn register(py: Python<'_>, func: Bound<'_, PyAny>, label: Option<String>) -> PyResult<CallbackOwner> {
    if !func.is_callable() {
        return Err(PyRuntimeError::new_err("register() expects a callable"));
    }
    let label = match label {
        Some(l) => l,
        None => func
            .getattr("__name__")
            .and_then(|n| n.extract::<String>())
            .unwrap_or_else(|_| "python-callback".to_owned()),
    };

    let callback: Arc<dyn Callback> = Arc::new(PyCallback {
        func: func.unbind(),
        label: label.clone(),
    });
    let handle = py
        .allow_threads(|| runtime().register(&callback))
        .map_err(to_py_err)?;

    Ok(CallbackOwner {
        callback: parking_lot::Mutex::new(Some(callback)),
        handle,
        label,
    })
}

/// Dispatch `args` to the callable registered for `handle`.
///
/// Raises `KeyError` if the handle is unknown or already released.
#[pyfunction]
#[pyo3(signature = (handle, args=None))]
fn invoke(py: Python<'_>, handle: u64, args: Option<Vec<u8>>) -> PyResult<PyObject> {
    let args = args.unwrap_or_default();
    let result = py
        .allow_threads(move || runtime().dispatch(NativeHandle::new(handle), &args))
        .map_err(to_py_err)?;
    Ok(PyBytes::new(py, &result).into_any().unbind())
}

/// True if `handle` is live and dispatchable.
#[pyfunction]
fn is_registered(handle: u64) -> bool {
    runtime().is_registered(NativeHandle::new(handle))
}

/// Release `handle` now, regardless of its owner.  Returns False if the
/// handle was still busy and has been left to the background sweep.
#[pyfunction]
fn deregister(py: Python<'_>, handle: u64) -> PyResult<bool> {
    py.allow_threads(move || runtime().deregister(NativeHandle::new(handle)))
        .map_err(to_py_err)
}

// ---------------------------------------------------------------------------
// Introspection / lifecycle
// ---------------------------------------------------------------------------

/// Registry and coordinator statistics as a dict.
#[pyfunction]
fn stats(py: Python<'_>) -> PyResult<PyObject> {
    let s = runtime().stats();
    let dict = PyDict::new(py);

    dict.set_item("active", s.active)?;
    dict.set_item("pending_release", s.pending_release)?;
    dict.set_item("in_flight", s.in_flight)?;
    dict.set_item("registered_total", s.registered_total)?;
    dict.set_item("released_total", s.released_total)?;
    dict.set_item("release_failures", s.release_failures)?;
    dict.set_item("sweeps", s.sweeps)?;

    let c = PyDict::new(py);
    c.set_item("phase", format!("{:?}", s.coordinator.phase).to_lowercase())?;
    c.set_item("running_threads", s.coordinator.running_threads)?;
    c.set_item("last_activity_ms", s.coordinator.last_activity_ms)?;
    c.set_item("sweeps", s.coordinator.sweeps)?;
    c.set_item("shut_down", s.coordinator.shut_down)?;
    dict.set_item("coordinator", c)?;

    Ok(dict.into())
}

/// Run one sweep on the calling thread; returns the number released.
#[pyfunction]
fn sweep(py: Python<'_>) -> usize {
    py.allow_threads(|| runtime().sweep_now().released)
}

/// Stop the coordinator and free every trampoline.  Returns the count freed.
#[pyfunction]
fn shutdown(py: Python<'_>) -> usize {
    py.allow_threads(|| RUNTIME.get().map(CallbackRuntime::shutdown).unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Module registration
// ---------------------------------------------------------------------------

/// Register the `nativecb` Python module.
#[pymodule]
fn nativecb(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<CallbackOwner>()?;
    m.add_function(wrap_pyfunction!(register, m)?)?;
    m.add_function(wrap_pyfunction!(invoke, m)?)?;
    m.add_function(wrap_pyfunction!(is_registered, m)?)?;
    m.add_function(wrap_pyfunction!(deregister, m)?)?;
    m.add_function(wrap_pyfunction!(stats, m)?)?;
    m.add_function(wrap_pyfunction!(sweep, m)?)?;
    m.add_function(wrap_pyfunction!(shutdown, m)?)?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Native callback trampolines with collection-driven release.")?;

    Ok(())
}
