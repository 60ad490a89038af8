//! Per-registration record.
//!
//! A [`CallbackHandle`] pairs a *weak* reference to the caller's callback
//! with the *strong* [`Trampoline`] it backs.  The caller keeps the callback
//! alive by holding an `Arc<dyn Callback>`; once every strong reference is
//! gone the handle reports itself collected and becomes eligible for release.
//!
//! # States
//!
//! ```text
//! ACTIVE --(collected / revoked)--> PENDING_RELEASE --(free ok)--> RELEASED
//!                                        ^      |
//!                                        +------+ (free failed, retried)
//! ```
//!
//! The gate mutex also carries the in-flight dispatch count.  A handle with
//! dispatches in flight is never moved past `PENDING_RELEASE`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::allocator::{NativeHandle, Trampoline};
use crate::errors::Result;

// ---------------------------------------------------------------------------
// Callback trait
// ---------------------------------------------------------------------------

/// Application code reachable from native code through a trampoline.
pub trait Callback: Send + Sync {
    /// Run the callback with the raw argument block supplied by the native
    /// caller.
    fn invoke(&self, args: &[u8]) -> Result<Vec<u8>>;

    /// Name used in logs and handed to the allocator.
    fn label(&self) -> &str {
        "callback"
    }
}

/// Adapts a closure into a labelled [`Callback`].
pub struct FnCallback<F> {
    label: String,
    func: F,
}

impl<F> FnCallback<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
        }
    }

    /// Box the closure straight into the shared form `register` expects.
    pub fn shared(label: impl Into<String>, func: F) -> Arc<dyn Callback> {
        Arc::new(Self::new(label, func))
    }
}

impl<F> Callback for FnCallback<F>
where
    F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync,
{
    fn invoke(&self, args: &[u8]) -> Result<Vec<u8>> {
        (self.func)(args)
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// Callback alive, dispatch allowed.
    Active,
    /// Callback collected (or revoked); waiting for the trampoline free.
    PendingRelease,
    /// A single releaser is inside the allocator's `free`.
    Releasing,
    /// Terminal; the entry has been removed from the registry.
    Released,
}

/// Outcome of [`CallbackHandle::begin_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseStep {
    /// Caller now exclusively owns the free.
    Proceed,
    /// Callback is still reachable.
    Reachable,
    /// Collected, but dispatches are still running.
    InFlight,
    /// Someone else is releasing or already released it.
    Done,
}

struct Gate {
    state: HandleState,
    in_flight: usize,
}

// ---------------------------------------------------------------------------
// CallbackHandle
// ---------------------------------------------------------------------------

pub struct CallbackHandle {
    native_handle: NativeHandle,
    label: String,
    callback: Weak<dyn Callback>,
    trampoline: Trampoline,
    registered_at: Instant,
    invocations: AtomicU64,
    gate: Mutex<Gate>,
    idle: Condvar,
}

impl CallbackHandle {
    pub(crate) fn new(trampoline: Trampoline, callback: &Arc<dyn Callback>, label: String) -> Self {
        Self {
            native_handle: trampoline.handle(),
            label,
            callback: Arc::downgrade(callback),
            trampoline,
            registered_at: Instant::now(),
            invocations: AtomicU64::new(0),
            gate: Mutex::new(Gate {
                state: HandleState::Active,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn native_handle(&self) -> NativeHandle {
        self.native_handle
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> HandleState {
        self.gate.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.gate.lock().in_flight
    }

    /// Completed dispatches over the handle's lifetime.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// True once no strong reference to the callback remains.  Never blocks
    /// and never flips back to false.
    pub fn is_collected(&self) -> bool {
        self.callback.strong_count() == 0
    }

    /// `ACTIVE` with the callback still reachable.
    pub fn is_dispatchable(&self) -> bool {
        self.gate.lock().state == HandleState::Active && !self.is_collected()
    }

    /// Free the native trampoline.  Idempotent: a second call returns
    /// `Ok(false)` without touching the allocator.
    pub fn release(&self) -> Result<bool> {
        self.trampoline.free()
    }

    pub fn is_released(&self) -> bool {
        self.trampoline.is_freed()
    }

    // -- dispatch side ------------------------------------------------------

    /// Start a dispatch.  Returns a strong reference to the callback and
    /// bumps the in-flight count, or `None` if the handle is no longer
    /// `ACTIVE`.
    pub(crate) fn enter(&self) -> Option<Arc<dyn Callback>> {
        let mut gate = self.gate.lock();
        if gate.state != HandleState::Active {
            return None;
        }
        match self.callback.upgrade() {
            Some(callback) => {
                gate.in_flight += 1;
                Some(callback)
            }
            None => {
                gate.state = HandleState::PendingRelease;
                None
            }
        }
    }

    /// Finish a dispatch started by [`enter`](Self::enter).  Returns true
    /// when this was the last in-flight call.
    pub(crate) fn exit(&self) -> bool {
        let mut gate = self.gate.lock();
        gate.in_flight = gate.in_flight.saturating_sub(1);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if gate.in_flight == 0 {
            self.idle.notify_all();
            true
        } else {
            false
        }
    }

    // -- release side -------------------------------------------------------

    /// Stop accepting dispatches regardless of whether the callback is still
    /// reachable.  Used by explicit deregistration and shutdown.
    pub(crate) fn revoke(&self) {
        let mut gate = self.gate.lock();
        if gate.state == HandleState::Active {
            gate.state = HandleState::PendingRelease;
        }
    }

    /// Wait (bounded) until no dispatch is in flight.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let mut gate = self.gate.lock();
        if gate.in_flight > 0 {
            self.idle
                .wait_while_for(&mut gate, |g| g.in_flight > 0, timeout);
        }
        gate.in_flight == 0
    }

    /// Decide whether the caller may free the trampoline now.  On
    /// [`ReleaseStep::Proceed`] the handle is in `RELEASING` and the caller
    /// must follow up with [`finish_release`](Self::finish_release).
    pub(crate) fn begin_release(&self, force: bool) -> ReleaseStep {
        let mut gate = self.gate.lock();
        match gate.state {
            HandleState::Releasing | HandleState::Released => return ReleaseStep::Done,
            HandleState::Active if !force && !self.is_collected() => return ReleaseStep::Reachable,
            HandleState::Active | HandleState::PendingRelease => {}
        }

        gate.state = HandleState::PendingRelease;
        if gate.in_flight > 0 {
            return ReleaseStep::InFlight;
        }
        gate.state = HandleState::Releasing;
        ReleaseStep::Proceed
    }

    /// Close a release started by [`begin_release`](Self::begin_release).
    /// A failed free puts the handle back into `PENDING_RELEASE`.
    pub(crate) fn finish_release(&self, freed: bool) {
        let mut gate = self.gate.lock();
        gate.state = if freed {
            HandleState::Released
        } else {
            HandleState::PendingRelease
        };
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gate = self.gate.lock();
        f.debug_struct("CallbackHandle")
            .field("native_handle", &self.native_handle)
            .field("label", &self.label)
            .field("state", &gate.state)
            .field("in_flight", &gate.in_flight)
            .field("collected", &self.is_collected())
            .finish()
    }
}
