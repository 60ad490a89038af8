//! JSON-RPC IPC worker hosting one callback runtime.
//!
//! Reads line-delimited JSON requests from stdin, dispatches to a
//! `nativecb_cli::worker::Session`, writes JSON responses to stdout.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nativecb_cli::worker::Session;

#[derive(Parser)]
#[command(name = "nativecb-worker", about = "nativecb JSON-RPC worker process")]
struct Args {
    /// Runtime configuration file (JSON). Defaults to NATIVECB_* variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    nativecb_cli::init_logging(args.verbose, false);

    let config = match nativecb_cli::load_config(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut session = match Session::new(config) {
        Ok(s) => s,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    log::info!("nativecb-worker: ready");

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::warn!("nativecb-worker: stdin read error: {e}");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let resp = session.handle_line(&line);
        let _ = writeln!(stdout, "{resp}");
        let _ = stdout.flush();

        if session.runtime().is_shut_down() {
            break;
        }
    }

    let freed = session.runtime().shutdown();
    log::info!("nativecb-worker: exiting, {freed} trampolines freed at shutdown");
    ExitCode::SUCCESS
}
