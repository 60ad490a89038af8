//! Shared plumbing for the `nativecb-worker` and `nativecb-stress` binaries.

pub mod worker;

use std::path::Path;

use nativecb_core::RuntimeConfig;

/// Configure `env_logger` on stderr.  `RUST_LOG` still overrides the level
/// chosen from the command-line flags.
pub fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Stderr)
        .init();
}

/// Load a JSON config file, or fall back to `NATIVECB_*` environment
/// variables when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .map_err(|e| format!("cannot read {}: {e}", p.display()))?;
            RuntimeConfig::from_json(&text).map_err(|e| e.to_string())
        }
        None => RuntimeConfig::from_env().map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let path = std::env::temp_dir().join(format!("nativecb-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"sweep_interval_ms": 42}"#).unwrap();
        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.sweep_interval_ms, 42);
        assert_eq!(config.max_trampolines, RuntimeConfig::default().max_trampolines);
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/nativecb.json"))).unwrap_err();
        assert!(err.contains("cannot read"));
    }
}
