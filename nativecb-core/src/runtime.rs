//! Explicit runtime context.
//!
//! [`CallbackRuntime`] owns one registry (and through it one coordinator).
//! Hosts construct it at their top level and shut it down on exit; tests
//! create as many independent instances as they like.  Dropping the
//! runtime performs [`shutdown`](CallbackRuntime::shutdown).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::allocator::{NativeHandle, SlotAllocator, TrampolineAllocator};
use crate::config::RuntimeConfig;
use crate::coordinator::{CoordinatorStatus, SweepReport};
use crate::errors::Result;
use crate::handle::{Callback, FnCallback};
use crate::registry::{Dispatch, EntrySnapshot, RegistryStats, TrampolineRegistry};

pub struct CallbackRuntime {
    registry: Arc<TrampolineRegistry>,
    shut_down: AtomicBool,
}

impl CallbackRuntime {
    /// Runtime backed by the in-process [`SlotAllocator`].
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let allocator = Arc::new(SlotAllocator::new(config.max_trampolines));
        Ok(Self::with_allocator(config, allocator))
    }

    /// Runtime backed by a host-provided allocator.
    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn TrampolineAllocator>) -> Self {
        log::debug!(
            "callback runtime: sweep every {} ms, linger {} ms",
            config.sweep_interval_ms,
            config.idle_linger_ms
        );
        Self {
            registry: TrampolineRegistry::new(config, allocator),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<TrampolineRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.registry.config()
    }

    /// Register `callback`; the returned handle stays valid for as long as
    /// the caller keeps a strong reference to it.
    pub fn register(&self, callback: &Arc<dyn Callback>) -> Result<NativeHandle> {
        self.registry.register(callback)
    }

    /// Wrap a closure, register it, and hand back the owning `Arc` along
    /// with its handle.
    pub fn register_fn<F>(&self, label: &str, func: F) -> Result<(Arc<dyn Callback>, NativeHandle)>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        let owner = FnCallback::shared(label, func);
        let handle = self.registry.register(&owner)?;
        Ok((owner, handle))
    }

    pub fn lookup(&self, handle: NativeHandle) -> Result<Dispatch<'_>> {
        self.registry.lookup(handle)
    }

    pub fn dispatch(&self, handle: NativeHandle, args: &[u8]) -> Result<Vec<u8>> {
        self.registry.dispatch(handle, args)
    }

    pub fn deregister(&self, handle: NativeHandle) -> Result<bool> {
        self.registry.deregister(handle)
    }

    /// Run a sweep on the calling thread.
    pub fn sweep_now(&self) -> SweepReport {
        self.registry.sweep()
    }

    /// Tell the coordinator an owner has just been dropped.
    pub fn notify_collected(&self) {
        self.registry.coordinator().wake();
    }

    /// True if `handle` is live and its callback still reachable.
    pub fn is_registered(&self, handle: NativeHandle) -> bool {
        self.registry.is_dispatchable(handle)
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.registry.entries()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn coordinator_status(&self) -> CoordinatorStatus {
        self.registry.coordinator().status()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the coordinator and free every outstanding trampoline.
    /// Idempotent; returns the number freed by this call.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.registry.coordinator().stop();
        let freed = self.registry.drain();
        log::debug!("callback runtime shut down, {freed} trampolines freed");
        freed
    }
}

impl Drop for CallbackRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Phase;
    use crate::errors::NativeCallbackError;
    use crate::test_support::{echo, wait_for, CountingAllocator};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            sweep_interval_ms: 10,
            idle_linger_ms: 0,
            drain_timeout_ms: 1_000,
            ..RuntimeConfig::default()
        }
    }

    fn runtime() -> (CallbackRuntime, Arc<CountingAllocator>) {
        let alloc = CountingAllocator::new(1_024);
        (CallbackRuntime::with_allocator(fast_config(), alloc.clone()), alloc)
    }

    #[test]
    fn test_register_invoke_drop_collect_idle() {
        let (rt, alloc) = runtime();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (owner, h) = rt
            .register_fn("A", move |args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args.to_vec())
            })
            .unwrap();

        assert_eq!(rt.dispatch(h, b"one").unwrap(), b"one".to_vec());
        assert_eq!(rt.dispatch(h, b"two").unwrap(), b"two".to_vec());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        drop(owner);
        rt.notify_collected();

        assert!(wait_for(|| rt.is_empty(), TIMEOUT));
        assert_eq!(alloc.free_count(h), 1);
        assert!(matches!(rt.dispatch(h, b""), Err(NativeCallbackError::NotFound(_))));
        assert!(wait_for(
            || rt.coordinator_status().phase == Phase::Stopped,
            TIMEOUT
        ));
        assert!(wait_for(|| rt.coordinator_status().running_threads == 0, TIMEOUT));
    }

    #[test]
    fn test_no_release_while_call_in_flight() {
        let (rt, alloc) = runtime();
        let rt = Arc::new(rt);
        let (entered_tx, entered_rx) = mpsc::channel::<()>();
        let (finish_tx, finish_rx) = mpsc::channel::<()>();
        let finish_rx = parking_lot::Mutex::new(finish_rx);

        let (owner, h) = rt
            .register_fn("blocking", move |_| {
                entered_tx.send(()).ok();
                finish_rx.lock().recv().ok();
                Ok(Vec::new())
            })
            .unwrap();

        let worker = {
            let rt = Arc::clone(&rt);
            thread::spawn(move || rt.dispatch(h, b"").is_ok())
        };
        entered_rx.recv().unwrap();

        // Every reference the test holds is gone; only the dispatch remains.
        drop(owner);
        for _ in 0..5 {
            rt.sweep_now();
            rt.notify_collected();
            thread::sleep(Duration::from_millis(20));
        }
        assert!(alloc.is_live(h));
        assert_eq!(alloc.free_count(h), 0);

        finish_tx.send(()).unwrap();
        assert!(worker.join().unwrap());

        assert!(wait_for(|| rt.is_empty(), TIMEOUT));
        assert_eq!(alloc.free_count(h), 1);
    }

    #[test]
    fn test_restart_reaches_running_before_register_returns() {
        let (rt, _alloc) = runtime();
        let (owner, _h) = rt.register_fn("first", |a| Ok(a.to_vec())).unwrap();
        drop(owner);
        rt.notify_collected();
        assert!(wait_for(
            || rt.coordinator_status().phase == Phase::Stopped && rt.is_empty(),
            TIMEOUT
        ));

        let cb = echo("second");
        let h = rt.register(&cb).unwrap();
        assert_eq!(rt.coordinator_status().phase, Phase::Running);
        assert!(rt.is_registered(h));
    }

    #[test]
    fn test_concurrent_register_and_collect_frees_exactly_once() {
        let (rt, alloc) = runtime();
        let rt = Arc::new(rt);

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let rt = Arc::clone(&rt);
                thread::spawn(move || {
                    for i in 0..50 {
                        let cb = echo(&format!("t{t}-{i}"));
                        let h = rt.register(&cb).unwrap();
                        assert_eq!(rt.dispatch(h, &[i as u8]).unwrap(), vec![i as u8]);
                        if i % 7 == 0 {
                            rt.sweep_now();
                        }
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        rt.notify_collected();
        assert!(wait_for(|| rt.stats().released_total == 400, TIMEOUT));
        assert!(rt.is_empty());
        assert_eq!(alloc.total_frees(), 400);
        assert!(alloc.all_freed_exactly_once());
        assert_eq!(rt.stats().registered_total, 400);
    }

    #[test]
    fn test_shutdown_releases_live_handles_and_is_idempotent() {
        let (rt, alloc) = runtime();
        let keep: Vec<_> = (0..3).map(|i| echo(&format!("k{i}"))).collect();
        let handles: Vec<_> = keep.iter().map(|cb| rt.register(cb).unwrap()).collect();

        assert_eq!(rt.shutdown(), 3);
        assert_eq!(rt.shutdown(), 0);
        assert!(rt.is_shut_down());
        assert!(rt.is_empty());
        assert_eq!(alloc.live_count(), 0);
        for h in handles {
            assert_eq!(alloc.free_count(h), 1);
            assert!(rt.dispatch(h, b"").is_err());
        }
        assert_eq!(rt.coordinator_status().running_threads, 0);
        assert!(matches!(rt.register(&keep[0]), Err(NativeCallbackError::ShutDown)));
    }

    #[test]
    fn test_dispatch_held_across_shutdown_frees_on_exit() {
        let alloc = CountingAllocator::new(8);
        let rt = CallbackRuntime::with_allocator(
            RuntimeConfig {
                drain_timeout_ms: 50,
                ..fast_config()
            },
            alloc.clone(),
        );
        let cb = echo("busy");
        let h = rt.register(&cb).unwrap();
        let dispatch = rt.lookup(h).unwrap();

        assert_eq!(rt.shutdown(), 0);
        assert!(alloc.is_live(h));

        drop(dispatch);
        drop(cb);
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(alloc.free_count(h), 1);
        assert!(rt.is_empty());
        assert_eq!(rt.shutdown(), 0);
    }

    #[test]
    fn test_is_registered_false_once_owner_dropped() {
        let (rt, _alloc) = runtime();
        let (owner, h) = rt.register_fn("owned", |a| Ok(a.to_vec())).unwrap();
        assert!(rt.is_registered(h));

        drop(owner);
        assert!(!rt.is_registered(h));
        assert!(rt.dispatch(h, b"").is_err());
    }

    #[test]
    fn test_register_racing_idle_stop_always_finds_coordinator_running() {
        let alloc = CountingAllocator::new(4_096);
        let rt = CallbackRuntime::with_allocator(
            RuntimeConfig {
                sweep_interval_ms: 1,
                idle_linger_ms: 0,
                ..RuntimeConfig::default()
            },
            alloc.clone(),
        );

        for i in 0..3_000 {
            let cb = echo("racer");
            let h = rt.register(&cb).unwrap();
            let status = rt.coordinator_status();
            assert_eq!(status.phase, Phase::Running, "iteration {i}");
            assert!(status.running_threads <= 1, "iteration {i}");
            assert!(rt.is_registered(h));
            drop(cb);
            rt.notify_collected();
        }

        assert!(wait_for(|| rt.is_empty(), TIMEOUT));
        assert!(alloc.all_freed_exactly_once());
        assert_eq!(alloc.total_frees(), 3_000);
    }

    #[test]
    fn test_drop_shuts_down() {
        let alloc = CountingAllocator::new(8);
        let cb = echo("held");
        {
            let rt = CallbackRuntime::with_allocator(fast_config(), alloc.clone());
            rt.register(&cb).unwrap();
        }
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(alloc.total_frees(), 1);
    }

    #[test]
    fn test_release_failure_retried_by_background_sweep() {
        let (rt, alloc) = runtime();
        alloc.fail_next_frees(2);
        let (owner, h) = rt.register_fn("flaky", |a| Ok(a.to_vec())).unwrap();
        drop(owner);
        rt.notify_collected();

        assert!(wait_for(|| rt.is_empty(), TIMEOUT));
        assert_eq!(alloc.free_count(h), 1);
        assert!(rt.stats().release_failures >= 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RuntimeConfig {
            max_trampolines: 0,
            ..RuntimeConfig::default()
        };
        assert!(matches!(
            CallbackRuntime::new(config),
            Err(NativeCallbackError::ConfigError(_))
        ));
    }

    #[test]
    fn test_slot_allocator_exhaustion_surfaces_to_register() {
        let config = RuntimeConfig {
            max_trampolines: 2,
            ..fast_config()
        };
        let rt = CallbackRuntime::new(config).unwrap();
        let a = echo("a");
        let b = echo("b");
        rt.register(&a).unwrap();
        rt.register(&b).unwrap();
        let err = rt.register(&echo("c")).unwrap_err();
        assert!(matches!(err, NativeCallbackError::AllocationError(_)));
        assert_eq!(rt.len(), 2);
    }
}
