//! Background sweep thread with a self-managed lifecycle.
//!
//! [`LifecycleCoordinator`] owns at most one sweep thread.  The thread is
//! spawned by [`ensure_running`](LifecycleCoordinator::ensure_running) on
//! registration and terminates on its own once the registry has been empty
//! for `idle_linger` with no registration racing in.  The next registration
//! starts a fresh thread.
//!
//! ```text
//! STOPPED --ensure_running--> STARTING --spawned--> RUNNING --idle/stop--> STOPPED
//! ```
//!
//! # Race-free stop
//!
//! Every `ensure_running` bumps an epoch under the coordinator mutex.  The
//! sweep thread records the epoch before sweeping and only stops if, under
//! the same mutex, the target is empty and the epoch is unchanged.  A
//! registration that lands after that decision blocks on the mutex, then
//! sees `STOPPED` and spawns a new thread.
//!
//! The thread holds only a `Weak` reference to its target, so dropping the
//! owning runtime also ends it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::errors::{NativeCallbackError, Result};

// ---------------------------------------------------------------------------
// Sweep target
// ---------------------------------------------------------------------------

/// What the coordinator sweeps.  Implemented by the registry.
pub trait SweepTarget: Send + Sync {
    /// One full pass over every entry.
    fn sweep(&self) -> SweepReport;

    fn is_empty(&self) -> bool;
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries looked at.
    pub examined: usize,
    /// Trampolines freed and removed.
    pub released: usize,
    /// Collected but blocked by in-flight dispatches.
    pub deferred: usize,
    /// Frees that failed; retried next pass.
    pub failed: usize,
    /// Entries left in the registry after the pass.
    pub remaining: usize,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
}

/// Observable coordinator state.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    /// Sweep threads currently alive (0 or 1).
    pub running_threads: usize,
    pub last_activity_ms: u64,
    pub sweeps: u64,
    pub shut_down: bool,
}

struct State {
    phase: Phase,
    epoch: u64,
    wake_pending: bool,
    shutdown: bool,
    last_activity: Instant,
    sweeps: u64,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    signal: Condvar,
    running_threads: AtomicUsize,
    sweep_interval: Duration,
    idle_linger: Duration,
    thread_name: String,
}

/// Decrements the running-thread count when the sweep thread exits, even by
/// panic, and makes sure a dead thread is never reported as running.
struct RunningGuard {
    shared: Arc<Shared>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("sweep thread panicked; coordinator reset to stopped");
            self.shared.state.lock().phase = Phase::Stopped;
        }
        self.shared.running_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// LifecycleCoordinator
// ---------------------------------------------------------------------------

pub struct LifecycleCoordinator {
    shared: Arc<Shared>,
}

impl LifecycleCoordinator {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    phase: Phase::Stopped,
                    epoch: 0,
                    wake_pending: false,
                    shutdown: false,
                    last_activity: Instant::now(),
                    sweeps: 0,
                    worker: None,
                }),
                signal: Condvar::new(),
                running_threads: AtomicUsize::new(0),
                sweep_interval: config.sweep_interval(),
                idle_linger: config.idle_linger(),
                thread_name: config.thread_name.clone(),
            }),
        }
    }

    /// Make sure a sweep thread is running for `target`.  Records activity
    /// even when the thread is already up.  Safe under concurrent callers:
    /// at most one thread exists at a time.
    pub fn ensure_running(&self, target: Weak<dyn SweepTarget>) -> Result<()> {
        let mut st = self.shared.state.lock();
        if st.shutdown {
            return Err(NativeCallbackError::ShutDown);
        }

        st.epoch = st.epoch.wrapping_add(1);
        st.last_activity = Instant::now();
        if st.phase != Phase::Stopped {
            return Ok(());
        }

        st.phase = Phase::Starting;

        // The previous thread has already decided to stop; reap it.
        if let Some(previous) = st.worker.take() {
            if previous.join().is_err() {
                log::warn!("previous sweep thread ended with a panic");
            }
        }

        self.shared.running_threads.fetch_add(1, Ordering::AcqRel);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.thread_name.clone())
            .spawn(move || sweep_loop(shared, target));

        match spawned {
            Ok(worker) => {
                st.worker = Some(worker);
                st.phase = Phase::Running;
                log::debug!("coordinator: sweep thread started");
                Ok(())
            }
            Err(e) => {
                self.shared.running_threads.fetch_sub(1, Ordering::AcqRel);
                st.phase = Phase::Stopped;
                log::error!("coordinator: failed to spawn sweep thread: {e}");
                Err(NativeCallbackError::CoordinatorError(format!(
                    "failed to spawn sweep thread: {e}"
                )))
            }
        }
    }

    /// Collection-notification signal: run a sweep now instead of waiting
    /// for the interval.  A wake that arrives while the thread is sweeping
    /// is kept and triggers another pass.
    pub fn wake(&self) {
        let mut st = self.shared.state.lock();
        st.wake_pending = true;
        self.shared.signal.notify_all();
    }

    /// Stop the sweep thread and refuse future starts.  Joins the thread
    /// unless called from it.  Idempotent.
    pub fn stop(&self) {
        let worker = {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            st.wake_pending = true;
            self.shared.signal.notify_all();
            st.worker.take()
        };

        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::warn!("sweep thread ended with a panic during stop");
            }
        }
        log::debug!("coordinator: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.phase() != Phase::Stopped
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Live sweep threads.  Drops to zero once an idle thread has exited.
    pub fn running_threads(&self) -> usize {
        self.shared.running_threads.load(Ordering::Acquire)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let st = self.shared.state.lock();
        CoordinatorStatus {
            phase: st.phase,
            running_threads: self.running_threads(),
            last_activity_ms: st.last_activity.elapsed().as_millis() as u64,
            sweeps: st.sweeps,
            shut_down: st.shutdown,
        }
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Sweep loop
// ---------------------------------------------------------------------------

fn sweep_loop(shared: Arc<Shared>, target: Weak<dyn SweepTarget>) {
    let _running = RunningGuard {
        shared: Arc::clone(&shared),
    };

    loop {
        let epoch_before = {
            let mut st = shared.state.lock();
            if !st.wake_pending && !st.shutdown {
                shared.signal.wait_for(&mut st, shared.sweep_interval);
            }
            st.wake_pending = false;
            if st.shutdown {
                st.phase = Phase::Stopped;
                break;
            }
            st.epoch
        };

        let Some(strong) = target.upgrade() else {
            log::debug!("coordinator: sweep target dropped, exiting");
            shared.state.lock().phase = Phase::Stopped;
            break;
        };

        let report = strong.sweep();
        if report.released > 0 || report.failed > 0 {
            log::debug!(
                "coordinator: sweep released {} deferred {} failed {} remaining {}",
                report.released,
                report.deferred,
                report.failed,
                report.remaining
            );
        }

        // Checked outside the lock: the epoch comparison below catches any
        // registration that lands in between.  `strong` may be the last
        // reference to the target, whose drop takes the coordinator lock.
        let empty = strong.is_empty();
        drop(strong);

        let mut st = shared.state.lock();
        st.sweeps += 1;
        if report.released > 0 {
            st.last_activity = Instant::now();
        }
        if st.shutdown {
            st.phase = Phase::Stopped;
            break;
        }

        let idle = empty
            && st.epoch == epoch_before
            && !st.wake_pending
            && st.last_activity.elapsed() >= shared.idle_linger;

        if idle {
            st.phase = Phase::Stopped;
            log::debug!("coordinator: registry empty, sweep thread idling down");
            break;
        }
    }
}
