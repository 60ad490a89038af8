//! Concurrency stress run: many threads register, dispatch and drop
//! callbacks while the background sweep releases them.  Prints the final
//! registry stats as JSON and fails if any trampoline leaked.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use nativecb_core::CallbackRuntime;
use rayon::prelude::*;

#[derive(Parser)]
#[command(name = "nativecb-stress", about = "Stress the nativecb register/dispatch/release cycle")]
struct Args {
    /// Number of callbacks to register
    #[arg(short = 'n', long, default_value = "10000")]
    callbacks: usize,

    /// Dispatches per callback before it is dropped
    #[arg(short, long, default_value = "8")]
    invocations: usize,

    /// Worker threads (0 = rayon default)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Seconds to wait for the registry to drain after the run
    #[arg(long, default_value = "30")]
    settle_secs: u64,

    /// Runtime configuration file (JSON). Defaults to NATIVECB_* variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compact JSON output (no pretty-printing)
    #[arg(long)]
    compact: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(args: &Args, runtime: &CallbackRuntime) -> Result<u64, String> {
    let dispatched = AtomicU64::new(0);
    (0..args.callbacks).into_par_iter().try_for_each(|i| {
        let (owner, handle) = runtime
            .register_fn(&format!("stress-{i}"), |a| Ok(a.to_vec()))
            .map_err(|e| e.to_string())?;
        let payload = (i as u64).to_le_bytes();
        for _ in 0..args.invocations {
            let out = runtime.dispatch(handle, &payload).map_err(|e| e.to_string())?;
            if out != payload {
                return Err(format!("{handle}: corrupted echo"));
            }
            dispatched.fetch_add(1, Ordering::Relaxed);
        }
        drop(owner);
        if i % 64 == 0 {
            runtime.notify_collected();
        }
        Ok(())
    })?;
    Ok(dispatched.into_inner())
}

fn main() -> ExitCode {
    let args = Args::parse();
    nativecb_cli::init_logging(args.verbose, false);

    if args.threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
        {
            log::warn!("could not size rayon pool: {e}");
        }
    }

    let config = match nativecb_cli::load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let runtime = match CallbackRuntime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let dispatched = match run(&args, &runtime) {
        Ok(n) => n,
        Err(e) => {
            log::error!("stress run failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "{} callbacks, {dispatched} dispatches in {:?}",
        args.callbacks,
        start.elapsed()
    );

    runtime.notify_collected();
    let deadline = Instant::now() + Duration::from_secs(args.settle_secs);
    while !runtime.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let stats = runtime.stats();
    let json = if args.compact {
        serde_json::to_string(&stats)
    } else {
        serde_json::to_string_pretty(&stats)
    };
    match json {
        Ok(j) => println!("{j}"),
        Err(e) => log::error!("stats serialization failed: {e}"),
    }

    let leaked = stats.active + stats.pending_release;
    runtime.shutdown();
    if leaked > 0 || stats.released_total != args.callbacks as u64 {
        log::error!(
            "{leaked} trampolines still registered, {} of {} released",
            stats.released_total,
            args.callbacks
        );
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
