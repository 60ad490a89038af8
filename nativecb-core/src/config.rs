//! Runtime configuration.
//!
//! [`RuntimeConfig`] can be built from defaults, a JSON document, or
//! `NATIVECB_*` environment variables.  Durations are stored as
//! milliseconds so the JSON form stays flat.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NativeCallbackError, Result};

/// Default pause between two sweeps of an idle-but-non-empty registry.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 250;

/// Default time an empty registry keeps the sweep thread alive.
pub const DEFAULT_IDLE_LINGER_MS: u64 = 1_000;

/// Default per-handle wait for in-flight dispatches during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Default capacity of the in-process [`crate::allocator::SlotAllocator`].
pub const DEFAULT_MAX_TRAMPOLINES: usize = 4_096;

const DEFAULT_THREAD_NAME: &str = "nativecb-sweeper";

/// Tunables for a [`crate::runtime::CallbackRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pause between sweeps when no wake signal arrives.
    pub sweep_interval_ms: u64,
    /// How long the coordinator stays up after the registry became empty.
    pub idle_linger_ms: u64,
    /// Bounded wait for in-flight dispatches when draining a handle.
    pub drain_timeout_ms: u64,
    /// Capacity of the default slot allocator.
    pub max_trampolines: usize,
    /// Name given to the background sweep thread.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            idle_linger_ms: DEFAULT_IDLE_LINGER_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            max_trampolines: DEFAULT_MAX_TRAMPOLINES,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a (possibly partial) JSON document; missing fields keep their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NATIVECB_SWEEP_INTERVAL_MS`,
    /// `NATIVECB_IDLE_LINGER_MS`, `NATIVECB_DRAIN_TIMEOUT_MS` and
    /// `NATIVECB_MAX_TRAMPOLINES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(v) = lookup("NATIVECB_SWEEP_INTERVAL_MS") {
            config.sweep_interval_ms = parse_env("NATIVECB_SWEEP_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("NATIVECB_IDLE_LINGER_MS") {
            config.idle_linger_ms = parse_env("NATIVECB_IDLE_LINGER_MS", &v)?;
        }
        if let Some(v) = lookup("NATIVECB_DRAIN_TIMEOUT_MS") {
            config.drain_timeout_ms = parse_env("NATIVECB_DRAIN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("NATIVECB_MAX_TRAMPOLINES") {
            config.max_trampolines = parse_env("NATIVECB_MAX_TRAMPOLINES", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would spin the sweep thread or make every
    /// registration fail.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(NativeCallbackError::ConfigError(
                "sweep_interval_ms must be greater than zero".into(),
            ));
        }
        if self.max_trampolines == 0 {
            return Err(NativeCallbackError::ConfigError(
                "max_trampolines must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_linger(&self) -> Duration {
        Duration::from_millis(self.idle_linger_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| NativeCallbackError::ConfigError(format!("{key}={value:?}: {e}")))
}
