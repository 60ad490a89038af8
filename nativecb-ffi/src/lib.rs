//! C ABI DLL for nativecb -- loadable by ctypes, C#, or any FFI consumer.
//!
//! All exported functions follow the convention:
//! - Return `i32` status code: `NATIVECB_OK=0`, `NATIVECB_ERROR=-1`,
//!   `NATIVECB_NOT_FOUND=-2` (dispatch on an unknown or released handle)
//! - String outputs allocated by Rust, freed via `nativecb_free_string()`
//! - Last error retrievable via `nativecb_last_error()`
//!
//! # Ownership
//!
//! `nativecb_register` returns two things: a `u64` handle for native code to
//! dispatch on, and an opaque `NativecbOwner*` that keeps the registration
//! alive.  Freeing the owner with `nativecb_owner_free()` is the C-side
//! equivalent of the managed object being collected: the trampoline is
//! released by the background sweep once no dispatch is running.

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::ptr;
use std::sync::{Arc, OnceLock};

use nativecb_core::{
    Callback, CallbackRuntime, NativeCallbackError, NativeHandle, RuntimeConfig, SlotAllocator,
};
use serde::Serialize;

pub const NATIVECB_OK: i32 = 0;
pub const NATIVECB_ERROR: i32 = -1;
pub const NATIVECB_NOT_FOUND: i32 = -2;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn fail(err: &NativeCallbackError) -> i32 {
    set_last_error(&err.to_string());
    match err {
        NativeCallbackError::NotFound(_) => NATIVECB_NOT_FOUND,
        _ => NATIVECB_ERROR,
    }
}

// ---------------------------------------------------------------------------
// Process-wide runtime
// ---------------------------------------------------------------------------

static RUNTIME: OnceLock<CallbackRuntime> = OnceLock::new();

fn build_runtime(config: RuntimeConfig) -> CallbackRuntime {
    let allocator = Arc::new(SlotAllocator::new(config.max_trampolines));
    CallbackRuntime::with_allocator(config, allocator)
}

fn runtime() -> &'static CallbackRuntime {
    RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::from_env().unwrap_or_else(|e| {
            log::warn!("nativecb: ignoring environment configuration: {e}");
            RuntimeConfig::default()
        });
        build_runtime(config)
    })
}

// ---------------------------------------------------------------------------
// C callback adapter
// ---------------------------------------------------------------------------

/// Signature of a C callback.  Receives the `user_data` given at
/// registration and the raw argument block; returns a host-defined status.
pub type NativecbCallbackFn =
    unsafe extern "C" fn(user_data: *mut c_void, args: *const u8, args_len: usize) -> i32;

struct CCallback {
    func: NativecbCallbackFn,
    user_data: *mut c_void,
    label: String,
}

// SAFETY: `nativecb_register` requires `user_data` to be usable from any
// thread for as long as the owner token lives.
unsafe impl Send for CCallback {}
unsafe impl Sync for CCallback {}

impl Callback for CCallback {
    fn invoke(&self, args: &[u8]) -> nativecb_core::Result<Vec<u8>> {
        // SAFETY: `func` and `user_data` were supplied together by the host.
        let status = unsafe { (self.func)(self.user_data, args.as_ptr(), args.len()) };
        Ok(status.to_le_bytes().to_vec())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Opaque owner token handed to C.  Keeps the callback reachable.
pub struct NativecbOwner {
    callback: Arc<dyn Callback>,
    handle: NativeHandle,
}

// ---------------------------------------------------------------------------
// Error / string helpers
// ---------------------------------------------------------------------------

/// Retrieve the last error message (thread-local).
///
/// Returns a pointer valid until the next nativecb_* call on this thread.
/// Returns null if no error has occurred.
#[no_mangle]
pub extern "C" fn nativecb_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Free a string previously allocated by a nativecb_* function.
///
/// # Safety
///
/// `ptr` must be a pointer returned by a nativecb_* function or null.
#[no_mangle]
pub unsafe extern "C" fn nativecb_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

/// Serialize `value` into a heap-allocated C string at `*out_json`.
unsafe fn write_json<T: Serialize>(value: &T, out_json: *mut *mut c_char) -> i32 {
    match serde_json::to_string(value) {
        Ok(json) => match CString::new(json) {
            Ok(cstr) => {
                unsafe { *out_json = cstr.into_raw() };
                NATIVECB_OK
            }
            Err(e) => {
                set_last_error(&format!("CString conversion failed: {e}"));
                NATIVECB_ERROR
            }
        },
        Err(e) => {
            set_last_error(&format!("JSON serialization failed: {e}"));
            NATIVECB_ERROR
        }
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialise the process-wide runtime from a JSON configuration document.
///
/// Optional: the first other call initialises from `NATIVECB_*` environment
/// variables instead.  Fails if the runtime already exists.
///
/// # Safety
///
/// `config_json` must be a valid null-terminated UTF-8 C string.
#[no_mangle]
pub unsafe extern "C" fn nativecb_init(config_json: *const c_char) -> i32 {
    if config_json.is_null() {
        set_last_error("config_json is null");
        return NATIVECB_ERROR;
    }

    let text = match unsafe { CStr::from_ptr(config_json) }.to_str() {
        Ok(s) => s,
        Err(e) => {
            set_last_error(&format!("Invalid UTF-8: {e}"));
            return NATIVECB_ERROR;
        }
    };

    let config = match RuntimeConfig::from_json(text) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };

    match RUNTIME.set(build_runtime(config)) {
        Ok(()) => NATIVECB_OK,
        Err(_rejected) => {
            set_last_error("runtime already initialised");
            NATIVECB_ERROR
        }
    }
}

/// Free every outstanding trampoline and stop the background sweep.
/// Idempotent.  No registration is accepted afterwards.
///
/// # Safety
///
/// `out_freed` must be null or a valid pointer to a `usize`.
#[no_mangle]
pub unsafe extern "C" fn nativecb_shutdown(out_freed: *mut usize) -> i32 {
    let freed = RUNTIME.get().map(CallbackRuntime::shutdown).unwrap_or(0);
    if !out_freed.is_null() {
        unsafe { *out_freed = freed };
    }
    NATIVECB_OK
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register a C callback.
///
/// On success `*out_handle` receives the native handle and `*out_owner` an
/// owner token that must eventually be passed to `nativecb_owner_free()`.
///
/// # Safety
///
/// - `func` must be a valid function pointer callable from any thread.
/// - `user_data` is passed back verbatim and must stay valid until the owner
///   is freed and no dispatch is running.
/// - `label` must be null or a valid null-terminated UTF-8 C string.
/// - `out_owner` and `out_handle` must be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn nativecb_register(
    func: Option<NativecbCallbackFn>,
    user_data: *mut c_void,
    label: *const c_char,
    out_owner: *mut *mut NativecbOwner,
    out_handle: *mut u64,
) -> i32 {
    let Some(func) = func else {
        set_last_error("func is null");
        return NATIVECB_ERROR;
    };
    if out_owner.is_null() || out_handle.is_null() {
        set_last_error("null pointer argument");
        return NATIVECB_ERROR;
    }

    let label = if label.is_null() {
        "c-callback".to_owned()
    } else {
        match unsafe { CStr::from_ptr(label) }.to_str() {
            Ok(s) => s.to_owned(),
            Err(e) => {
                set_last_error(&format!("Invalid UTF-8: {e}"));
                return NATIVECB_ERROR;
            }
        }
    };

    let callback: Arc<dyn Callback> = Arc::new(CCallback {
        func,
        user_data,
        label,
    });

    match runtime().register(&callback) {
        Ok(handle) => {
            let owner = Box::new(NativecbOwner { callback, handle });
            unsafe {
                *out_handle = handle.as_raw();
                *out_owner = Box::into_raw(owner);
            }
            NATIVECB_OK
        }
        Err(e) => fail(&e),
    }
}

/// Drop an owner token.  The handle stops accepting new dispatches and its
/// trampoline is freed by the background sweep.
///
/// # Safety
///
/// `owner` must be a pointer returned by `nativecb_register` or null, and
/// must not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn nativecb_owner_free(owner: *mut NativecbOwner) {
    if owner.is_null() {
        return;
    }
    let owner = unsafe { Box::from_raw(owner) };
    log::debug!("nativecb: owner of {} freed", owner.handle);
    drop(owner.callback);
    if let Some(rt) = RUNTIME.get() {
        rt.notify_collected();
    }
}

/// Release `handle` immediately, independent of its owner token (which must
/// still be freed).
#[no_mangle]
pub extern "C" fn nativecb_deregister(handle: u64) -> i32 {
    match runtime().deregister(NativeHandle::new(handle)) {
        Ok(_) => NATIVECB_OK,
        Err(e) => fail(&e),
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Dispatch to the callback registered for `handle`.
///
/// Returns `NATIVECB_NOT_FOUND` if the handle is unknown or already
/// released; the callback's own status is written to `*out_status`.
///
/// # Safety
///
/// `args` must point to `args_len` readable bytes (or be null with
/// `args_len == 0`).  `out_status` must be null or a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn nativecb_invoke(
    handle: u64,
    args: *const u8,
    args_len: usize,
    out_status: *mut i32,
) -> i32 {
    let args_slice: &[u8] = if args.is_null() || args_len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(args, args_len) }
    };

    match runtime().dispatch(NativeHandle::new(handle), args_slice) {
        Ok(result) => {
            if !out_status.is_null() {
                let mut raw = [0u8; 4];
                let n = result.len().min(4);
                raw[..n].copy_from_slice(&result[..n]);
                unsafe { *out_status = i32::from_le_bytes(raw) };
            }
            NATIVECB_OK
        }
        Err(e) => fail(&e),
    }
}

/// Returns 1 if `handle` is live and dispatchable, 0 otherwise.
#[no_mangle]
pub extern "C" fn nativecb_is_registered(handle: u64) -> i32 {
    i32::from(runtime().is_registered(NativeHandle::new(handle)))
}

/// Registry statistics as a JSON string.
///
/// # Safety
///
/// `out_json` must be a valid pointer to a `*mut c_char`.
/// On success, `*out_json` is set to a heap-allocated JSON C string.
/// Caller must free with `nativecb_free_string()`.
#[no_mangle]
pub unsafe extern "C" fn nativecb_stats(out_json: *mut *mut c_char) -> i32 {
    if out_json.is_null() {
        set_last_error("out_json is null");
        return NATIVECB_ERROR;
    }
    unsafe { write_json(&runtime().stats(), out_json) }
}
