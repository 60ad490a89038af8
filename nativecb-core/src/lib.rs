//! `nativecb_core` -- Pure Rust core for native-callback lifetime management.
//!
//! Managed code registers a callback, native code calls it back through an
//! opaque trampoline handle, and the trampoline is freed once the callback's
//! owner is gone and no call is running.  This crate has **no PyO3
//! dependency**.  It is consumed by:
//! - `nativecb-pyo3` (PyO3 Python extension)
//! - `nativecb-ffi` (C ABI DLL for ctypes / other languages)
//! - `nativecb-cli` (worker and stress tools)
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`errors`] | `NativeCallbackError` enum via `thiserror` |
//! | [`config`] | `RuntimeConfig` from defaults, JSON or environment |
//! | [`allocator`] | `TrampolineAllocator` seam, `SlotAllocator`, owned `Trampoline` |
//! | [`handle`] | `Callback` trait and the per-registration `CallbackHandle` |
//! | [`registry`] | `TrampolineRegistry`: handle table, dispatch guard, sweep |
//! | [`coordinator`] | `LifecycleCoordinator`: self-stopping background sweep thread |
//! | [`runtime`] | `CallbackRuntime`: explicit context owning the above |
//!
//! # Usage
//!
//! ```
//! use nativecb_core::{CallbackRuntime, RuntimeConfig};
//!
//! let runtime = CallbackRuntime::new(RuntimeConfig::default()).unwrap();
//! let (owner, handle) = runtime
//!     .register_fn("echo", |args| Ok(args.to_vec()))
//!     .unwrap();
//!
//! assert_eq!(runtime.dispatch(handle, b"hi").unwrap(), b"hi");
//!
//! // Dropping the owner makes the handle eligible for release.
//! drop(owner);
//! runtime.sweep_now();
//! assert!(runtime.dispatch(handle, b"hi").is_err());
//! ```

pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod handle;
pub mod registry;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;

pub use allocator::{CallbackDescriptor, NativeHandle, SlotAllocator, TrampolineAllocator};
pub use config::RuntimeConfig;
pub use coordinator::{CoordinatorStatus, LifecycleCoordinator, Phase, SweepReport};
pub use errors::{NativeCallbackError, Result};
pub use handle::{Callback, CallbackHandle, FnCallback, HandleState};
pub use registry::{Dispatch, RegistryStats, TrampolineRegistry};
pub use runtime::CallbackRuntime;
