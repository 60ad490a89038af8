//! Handle → callback table.
//!
//! [`TrampolineRegistry`] is the single source of truth for "is this native
//! handle alive".  Native dispatch goes through [`lookup`](TrampolineRegistry::lookup);
//! the coordinator's sweep goes through
//! [`release_if_collected`](TrampolineRegistry::release_if_collected).
//!
//! # Locking
//!
//! The map lives behind a `parking_lot::RwLock`; each entry has its own gate
//! mutex.  Lock order is map → gate.  `lookup` clones the entry out of the
//! map and drops the map lock before touching the gate, so dispatches on
//! different handles never contend on anything but the read lock.
//!
//! A release moves the entry to `RELEASED` and removes it from the map while
//! holding the map's write lock, so no reader ever sees a released entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::allocator::{CallbackDescriptor, NativeHandle, Trampoline, TrampolineAllocator};
use crate::config::RuntimeConfig;
use crate::coordinator::{CoordinatorStatus, LifecycleCoordinator, SweepReport, SweepTarget};
use crate::errors::{NativeCallbackError, Result};
use crate::handle::{Callback, CallbackHandle, HandleState, ReleaseStep};

// ---------------------------------------------------------------------------
// Dispatch guard
// ---------------------------------------------------------------------------

/// A running dispatch.  Holds the callback alive and keeps the handle's
/// in-flight count raised until dropped.
pub struct Dispatch<'a> {
    // Field order matters: the callback reference is dropped before the
    // in-flight count is lowered.
    callback: Arc<dyn Callback>,
    guard: InFlight<'a>,
}

struct InFlight<'a> {
    registry: &'a TrampolineRegistry,
    entry: Arc<CallbackHandle>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.entry.exit() {
            return;
        }
        // After shutdown no sweep will run again; the last call out frees
        // whatever drain had to leave behind.
        if self.registry.coordinator.is_shut_down() {
            if let Err(e) = self.registry.release_entry(&self.entry, true) {
                log::warn!("release after shutdown: {e}");
            }
        } else if self.entry.is_collected() {
            self.registry.coordinator.wake();
        }
    }
}

impl Dispatch<'_> {
    pub fn handle(&self) -> NativeHandle {
        self.guard.entry.native_handle()
    }

    pub fn callback(&self) -> &dyn Callback {
        self.callback.as_ref()
    }

    pub fn invoke(&self, args: &[u8]) -> Result<Vec<u8>> {
        self.callback.invoke(args)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time registry snapshot -- fully `Send` and serializable.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub pending_release: usize,
    pub in_flight: usize,
    pub registered_total: u64,
    pub released_total: u64,
    pub release_failures: u64,
    pub sweeps: u64,
    pub coordinator: CoordinatorStatus,
}

/// One entry as seen by [`TrampolineRegistry::entries`].
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub handle: NativeHandle,
    pub label: String,
    pub state: HandleState,
    pub in_flight: usize,
    pub invocations: u64,
    pub collected: bool,
}

#[derive(Default)]
struct Counters {
    registered: AtomicU64,
    released: AtomicU64,
    release_failures: AtomicU64,
    sweeps: AtomicU64,
}

// ---------------------------------------------------------------------------
// TrampolineRegistry
// ---------------------------------------------------------------------------

pub struct TrampolineRegistry {
    entries: RwLock<HashMap<NativeHandle, Arc<CallbackHandle>>>,
    allocator: Arc<dyn TrampolineAllocator>,
    coordinator: LifecycleCoordinator,
    config: RuntimeConfig,
    counters: Counters,
}

impl TrampolineRegistry {
    pub fn new(config: RuntimeConfig, allocator: Arc<dyn TrampolineAllocator>) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            allocator,
            coordinator: LifecycleCoordinator::new(&config),
            config,
            counters: Counters::default(),
        })
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Allocate a trampoline for `callback` and start tracking it.
    ///
    /// Only a weak reference to `callback` is kept: the caller's `Arc` is
    /// what keeps the registration alive.  On any error the registry is
    /// left as it was.
    pub fn register(self: &Arc<Self>, callback: &Arc<dyn Callback>) -> Result<NativeHandle> {
        if self.coordinator.is_shut_down() {
            return Err(NativeCallbackError::ShutDown);
        }

        let descriptor = CallbackDescriptor::new(callback.label());
        let handle = self.allocator.allocate(&descriptor)?;
        let trampoline = Trampoline::new(handle, Arc::clone(&self.allocator));
        let entry = Arc::new(CallbackHandle::new(trampoline, callback, descriptor.label));

        {
            let mut entries = self.entries.write();
            if entries.contains_key(&handle) {
                panic!("allocator returned native handle {handle} while it is still registered");
            }
            entries.insert(handle, Arc::clone(&entry));
        }

        let target: Weak<dyn SweepTarget> = Arc::downgrade(self) as Weak<dyn SweepTarget>;
        if let Err(e) = self.coordinator.ensure_running(target) {
            self.entries.write().remove(&handle);
            if let Err(free_err) = entry.release() {
                log::warn!("rollback of {handle} could not free trampoline: {free_err}");
            }
            return Err(e);
        }

        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        log::debug!("registered '{}' as {handle}", entry.label());
        Ok(handle)
    }

    /// Begin a dispatch on `handle`.
    ///
    /// Fails with `NotFound` for unknown handles and for handles whose
    /// callback has been collected or revoked; nothing stale is touched.
    pub fn lookup(&self, handle: NativeHandle) -> Result<Dispatch<'_>> {
        let entry = self
            .entries
            .read()
            .get(&handle)
            .cloned()
            .ok_or(NativeCallbackError::NotFound(handle))?;

        match entry.enter() {
            Some(callback) => Ok(Dispatch {
                callback,
                guard: InFlight {
                    registry: self,
                    entry,
                },
            }),
            None => {
                if entry.is_collected() {
                    self.coordinator.wake();
                }
                Err(NativeCallbackError::NotFound(handle))
            }
        }
    }

    /// `lookup` followed by the invocation itself.
    pub fn dispatch(&self, handle: NativeHandle, args: &[u8]) -> Result<Vec<u8>> {
        self.lookup(handle)?.invoke(args)
    }

    /// Free `handle`'s trampoline if its callback has been collected and no
    /// dispatch is running.  Returns whether a release happened.
    pub fn release_if_collected(&self, handle: NativeHandle) -> Result<bool> {
        let Some(entry) = self.entries.read().get(&handle).cloned() else {
            return Ok(false);
        };
        self.release_entry(&entry, false)
    }

    /// Release `handle` now, without waiting for collection.  Waits up to
    /// the drain timeout for in-flight dispatches; if they are still running
    /// the handle stays revoked and the sweep frees it later.
    pub fn deregister(&self, handle: NativeHandle) -> Result<bool> {
        let entry = self
            .entries
            .read()
            .get(&handle)
            .cloned()
            .ok_or(NativeCallbackError::NotFound(handle))?;

        entry.revoke();
        if !entry.wait_idle(self.config.drain_timeout()) {
            log::warn!("deregister {handle}: dispatch still in flight, deferring to sweep");
            self.coordinator.wake();
            return Ok(false);
        }
        self.release_entry(&entry, false)
    }

    fn release_entry(&self, entry: &Arc<CallbackHandle>, force: bool) -> Result<bool> {
        if entry.begin_release(force) != ReleaseStep::Proceed {
            return Ok(false);
        }

        let handle = entry.native_handle();
        match entry.release() {
            Ok(_) => {
                let mut entries = self.entries.write();
                entry.finish_release(true);
                entries.remove(&handle);
                drop(entries);

                self.counters.released.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "released '{}' ({handle}) after {} invocations",
                    entry.label(),
                    entry.invocations()
                );
                Ok(true)
            }
            Err(NativeCallbackError::DoubleRelease(h)) => {
                panic!("trampoline {h} released twice; native callback table is corrupt")
            }
            Err(e) => {
                entry.finish_release(false);
                self.counters.release_failures.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    e @ NativeCallbackError::ReleaseError { .. } => e,
                    other => NativeCallbackError::ReleaseError {
                        handle,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// One pass of [`release_if_collected`](Self::release_if_collected)
    /// over every entry.  A failing entry is logged and skipped.
    pub fn sweep(&self) -> SweepReport {
        let snapshot = self.snapshot();
        let mut report = SweepReport {
            examined: snapshot.len(),
            ..SweepReport::default()
        };

        for entry in &snapshot {
            match self.release_entry(entry, false) {
                Ok(true) => report.released += 1,
                Ok(false) => {
                    if entry.state() == HandleState::PendingRelease {
                        report.deferred += 1;
                    }
                }
                Err(e) => {
                    log::warn!("sweep: {e}");
                    report.failed += 1;
                }
            }
        }

        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        report.remaining = self.len();
        report
    }

    /// Revoke and free every entry.  All handles share one drain timeout for
    /// their in-flight dispatches; one that is still busy after that is not
    /// freed under a running call.  Once the coordinator is shut down, the
    /// last such dispatch frees it on exit.  Returns the number of
    /// trampolines freed here.
    pub fn drain(&self) -> usize {
        let snapshot = self.snapshot();
        for entry in &snapshot {
            entry.revoke();
        }

        let deadline = Instant::now() + self.config.drain_timeout();
        let mut freed = 0;
        for entry in &snapshot {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !entry.wait_idle(remaining) {
                log::warn!(
                    "drain: {} still has {} dispatches in flight, deferring free to their exit",
                    entry.native_handle(),
                    entry.in_flight()
                );
                continue;
            }
            match self.release_entry(entry, true) {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(e) => log::warn!("drain: {e}"),
            }
        }

        log::debug!("drain freed {freed} of {} trampolines", snapshot.len());
        freed
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn contains(&self, handle: NativeHandle) -> bool {
        self.entries.read().contains_key(&handle)
    }

    /// True if a dispatch on `handle` would reach its callback right now.
    pub fn is_dispatchable(&self, handle: NativeHandle) -> bool {
        self.entries
            .read()
            .get(&handle)
            .cloned()
            .is_some_and(|entry| entry.is_dispatchable())
    }

    pub fn state_of(&self, handle: NativeHandle) -> Option<HandleState> {
        let entry = self.entries.read().get(&handle).cloned()?;
        Some(entry.state())
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.snapshot()
            .iter()
            .map(|e| EntrySnapshot {
                handle: e.native_handle(),
                label: e.label().to_owned(),
                state: e.state(),
                in_flight: e.in_flight(),
                invocations: e.invocations(),
                collected: e.is_collected(),
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let snapshot = self.snapshot();
        let mut active = 0;
        let mut pending_release = 0;
        let mut in_flight = 0;
        for entry in &snapshot {
            match entry.state() {
                HandleState::Active => active += 1,
                HandleState::PendingRelease | HandleState::Releasing => pending_release += 1,
                HandleState::Released => {}
            }
            in_flight += entry.in_flight();
        }

        RegistryStats {
            active,
            pending_release,
            in_flight,
            registered_total: self.counters.registered.load(Ordering::Relaxed),
            released_total: self.counters.released.load(Ordering::Relaxed),
            release_failures: self.counters.release_failures.load(Ordering::Relaxed),
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
            coordinator: self.coordinator.status(),
        }
    }

    // Entries are cloned out so callers never hold the map lock while
    // taking a gate.
    fn snapshot(&self) -> Vec<Arc<CallbackHandle>> {
        self.entries.read().values().cloned().collect()
    }
}

impl SweepTarget for TrampolineRegistry {
    fn sweep(&self) -> SweepReport {
        TrampolineRegistry::sweep(self)
    }

    fn is_empty(&self) -> bool {
        TrampolineRegistry::is_empty(self)
    }
}

impl fmt::Debug for TrampolineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrampolineRegistry")
            .field("entries", &self.len())
            .field("phase", &self.coordinator.phase())
            .finish()
    }
}
