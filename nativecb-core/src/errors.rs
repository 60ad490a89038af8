//! Error types for `nativecb_core`.
//!
//! All Rust-side failures are funnelled through [`NativeCallbackError`], which
//! uses `thiserror` for `Display` and `Error` derives.  PyO3 and C ABI
//! conversion is handled in the binding crates, keeping this crate host-free.

use thiserror::Error;

use crate::allocator::NativeHandle;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NativeCallbackError>;

/// Top-level error type for the `nativecb_core` library.
#[derive(Debug, Error)]
pub enum NativeCallbackError {
    /// The trampoline allocator could not produce a native entry point.
    /// Surfaced synchronously from `register`; the registry is unchanged.
    #[error("AllocationError: {0}")]
    AllocationError(String),

    /// Dispatch against a handle that was never registered, is pending
    /// release, or has already been released.
    #[error("NotFound: no live callback for handle {0}")]
    NotFound(NativeHandle),

    /// Freeing a trampoline failed.  The handle stays pending and the next
    /// sweep retries it.
    #[error("ReleaseError: handle {handle}: {reason}")]
    ReleaseError { handle: NativeHandle, reason: String },

    /// An allocator was asked to free a handle it no longer owns.  The
    /// registry turns this into a panic.
    #[error("DoubleRelease: handle {0} freed twice")]
    DoubleRelease(NativeHandle),

    /// The registered callback itself reported a failure.
    #[error("InvocationError: {0}")]
    InvocationError(String),

    /// The background sweep thread could not be started.
    #[error("CoordinatorError: {0}")]
    CoordinatorError(String),

    /// The runtime has been shut down and accepts no new registrations.
    #[error("ShutDown: callback runtime has been shut down")]
    ShutDown,

    /// Configuration could not be parsed or failed validation.
    #[error("ConfigError: {0}")]
    ConfigError(String),
}

impl NativeCallbackError {
    /// Whether the caller can recover by retrying or ignoring the failure.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NativeCallbackError::DoubleRelease(_))
    }
}

impl From<serde_json::Error> for NativeCallbackError {
    fn from(err: serde_json::Error) -> Self {
        NativeCallbackError::ConfigError(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_kind() {
        let err = NativeCallbackError::NotFound(NativeHandle::new(7));
        assert!(err.to_string().starts_with("NotFound:"));

        let err = NativeCallbackError::ReleaseError {
            handle: NativeHandle::new(3),
            reason: "busy".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ReleaseError"));
        assert!(msg.contains("busy"));
    }

    #[test]
    fn test_double_release_is_not_recoverable() {
        assert!(!NativeCallbackError::DoubleRelease(NativeHandle::new(1)).is_recoverable());
        assert!(NativeCallbackError::ShutDown.is_recoverable());
    }

    #[test]
    fn test_json_error_maps_to_config_error() {
        let err: NativeCallbackError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, NativeCallbackError::ConfigError(_)));
    }
}
