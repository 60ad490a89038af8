//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::allocator::{CallbackDescriptor, NativeHandle, SlotAllocator, TrampolineAllocator};
use crate::errors::{NativeCallbackError, Result};
use crate::handle::{Callback, FnCallback};

/// Poll `cond` every 5 ms until it holds or `max_wait` elapses.
pub fn wait_for(mut cond: impl FnMut() -> bool, max_wait: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() <= max_wait {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn echo(label: &str) -> Arc<dyn Callback> {
    FnCallback::shared(label, |args: &[u8]| Ok(args.to_vec()))
}

/// Slot allocator that records every free per handle and can be told to
/// fail the next few frees or allocations.
pub struct CountingAllocator {
    inner: SlotAllocator,
    frees: Mutex<HashMap<NativeHandle, usize>>,
    fail_frees: AtomicUsize,
    fail_allocs: AtomicUsize,
}

impl CountingAllocator {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: SlotAllocator::new(capacity),
            frees: Mutex::new(HashMap::new()),
            fail_frees: AtomicUsize::new(0),
            fail_allocs: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_frees(&self, n: usize) {
        self.fail_frees.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_allocs(&self, n: usize) {
        self.fail_allocs.store(n, Ordering::SeqCst);
    }

    pub fn free_count(&self, handle: NativeHandle) -> usize {
        self.frees.lock().get(&handle).copied().unwrap_or(0)
    }

    pub fn total_frees(&self) -> usize {
        self.frees.lock().values().sum()
    }

    pub fn all_freed_exactly_once(&self) -> bool {
        self.frees.lock().values().all(|&n| n == 1)
    }

    pub fn live_count(&self) -> usize {
        self.inner.live_count()
    }

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.inner.is_live(handle)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TrampolineAllocator for CountingAllocator {
    fn allocate(&self, descriptor: &CallbackDescriptor) -> Result<NativeHandle> {
        if Self::take_failure(&self.fail_allocs) {
            return Err(NativeCallbackError::AllocationError("injected".into()));
        }
        self.inner.allocate(descriptor)
    }

    fn free(&self, handle: NativeHandle) -> Result<()> {
        if Self::take_failure(&self.fail_frees) {
            return Err(NativeCallbackError::ReleaseError {
                handle,
                reason: "injected".into(),
            });
        }
        *self.frees.lock().entry(handle).or_insert(0) += 1;
        self.inner.free(handle)
    }
}
