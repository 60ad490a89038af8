//! Native trampoline allocation seam.
//!
//! The binding layer that actually emits native-callable entry points is an
//! external collaborator.  It is reached through [`TrampolineAllocator`]:
//! "allocate a trampoline for this callback, give me an opaque handle" and
//! "free that handle".  [`SlotAllocator`] is the in-process implementation
//! used by the C ABI, the Python module, the CLI tools and the tests.
//!
//! [`Trampoline`] is the strong owner of one allocation.  It frees through
//! the allocator at most once.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{NativeCallbackError, Result};

// ---------------------------------------------------------------------------
// Handle + descriptor
// ---------------------------------------------------------------------------

/// Opaque identifier of an allocated trampoline.
///
/// `0` is reserved as the null handle and is never handed out by
/// [`SlotAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// What the allocator gets told about the callback it is wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackDescriptor {
    /// Human-readable name used in logs and stats.
    pub label: String,
}

impl CallbackDescriptor {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

// ---------------------------------------------------------------------------
// Allocator trait
// ---------------------------------------------------------------------------

/// Native side of the trampoline lifecycle.
///
/// Implementations must hand out process-unique handles that are never
/// reused while a previous allocation with the same value is live.  `free`
/// is called exactly once per handle; an implementation that can detect a
/// repeated free should report [`NativeCallbackError::DoubleRelease`].
pub trait TrampolineAllocator: Send + Sync {
    fn allocate(&self, descriptor: &CallbackDescriptor) -> Result<NativeHandle>;

    fn free(&self, handle: NativeHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-process slot table
// ---------------------------------------------------------------------------

/// Fixed-capacity table of trampoline slots with monotonically increasing
/// ids.  Ids are never recycled, which keeps stale handles from aliasing a
/// newer registration.
pub struct SlotAllocator {
    next_id: AtomicU64,
    live: Mutex<HashSet<NativeHandle>>,
    capacity: usize,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            capacity,
        }
    }

    /// Number of slots currently allocated.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_live(&self, handle: NativeHandle) -> bool {
        self.live.lock().contains(&handle)
    }
}

impl TrampolineAllocator for SlotAllocator {
    fn allocate(&self, descriptor: &CallbackDescriptor) -> Result<NativeHandle> {
        let mut live = self.live.lock();
        if live.len() >= self.capacity {
            return Err(NativeCallbackError::AllocationError(format!(
                "trampoline table full ({} slots) while registering '{}'",
                self.capacity, descriptor.label
            )));
        }

        let handle = NativeHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        live.insert(handle);
        Ok(handle)
    }

    fn free(&self, handle: NativeHandle) -> Result<()> {
        if self.live.lock().remove(&handle) {
            Ok(())
        } else {
            Err(NativeCallbackError::DoubleRelease(handle))
        }
    }
}

impl fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("live", &self.live_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Owned allocation
// ---------------------------------------------------------------------------

/// Strong owner of one native allocation.
///
/// There is no `Drop` impl: a trampoline that is never freed leaks until
/// process exit, which is preferable to freeing one that native code may
/// still call.
pub struct Trampoline {
    handle: NativeHandle,
    allocator: Arc<dyn TrampolineAllocator>,
    // Held across the allocator call so concurrent callers serialize.
    freed: Mutex<bool>,
}

impl Trampoline {
    pub(crate) fn new(handle: NativeHandle, allocator: Arc<dyn TrampolineAllocator>) -> Self {
        Self {
            handle,
            allocator,
            freed: Mutex::new(false),
        }
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    pub fn is_freed(&self) -> bool {
        *self.freed.lock()
    }

    /// Free the allocation.  Returns `Ok(false)` when it was already freed.
    /// On error the trampoline stays allocated and may be retried.
    pub(crate) fn free(&self) -> Result<bool> {
        let mut freed = self.freed.lock();
        if *freed {
            return Ok(false);
        }
        self.allocator.free(self.handle)?;
        *freed = true;
        Ok(true)
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("handle", &self.handle)
            .field("freed", &self.is_freed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allocator_hands_out_unique_non_null_ids() {
        let alloc = SlotAllocator::new(8);
        let desc = CallbackDescriptor::new("t");
        let a = alloc.allocate(&desc).unwrap();
        let b = alloc.allocate(&desc).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(alloc.live_count(), 2);
    }

    #[test]
    fn test_slot_allocator_never_recycles_ids() {
        let alloc = SlotAllocator::new(1);
        let desc = CallbackDescriptor::new("t");
        let a = alloc.allocate(&desc).unwrap();
        alloc.free(a).unwrap();
        let b = alloc.allocate(&desc).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_slot_allocator_capacity() {
        let alloc = SlotAllocator::new(1);
        let desc = CallbackDescriptor::new("overflow");
        alloc.allocate(&desc).unwrap();
        let err = alloc.allocate(&desc).unwrap_err();
        assert!(matches!(err, NativeCallbackError::AllocationError(_)));
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_slot_allocator_reports_double_free() {
        let alloc = SlotAllocator::new(4);
        let h = alloc.allocate(&CallbackDescriptor::new("t")).unwrap();
        alloc.free(h).unwrap();
        assert!(matches!(
            alloc.free(h),
            Err(NativeCallbackError::DoubleRelease(x)) if x == h
        ));
    }

    #[test]
    fn test_trampoline_frees_once() {
        let alloc = Arc::new(SlotAllocator::new(4));
        let h = alloc.allocate(&CallbackDescriptor::new("t")).unwrap();
        let tramp = Trampoline::new(h, alloc.clone());
        assert!(tramp.free().unwrap());
        assert!(!tramp.free().unwrap());
        assert!(tramp.is_freed());
        assert!(!alloc.is_live(h));
    }

    #[test]
    fn test_handle_display_is_hex() {
        assert_eq!(NativeHandle::new(255).to_string(), "0xff");
        assert!(NativeHandle::NULL.is_null());
    }
}
