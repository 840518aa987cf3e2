//! Test-runner launcher.
//!
//! Thin wrapper that optionally runs cleanup passes around a wrapped
//! runner command and forwards its exit code. An unrecognized option exits
//! with 1.

use std::process::{Command, ExitCode};

use clap::Parser;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "tidepool-launch", version, about = "Run a test command under the engine wrapper")]
struct Args {
    /// Run the cleanup pass before the wrapped command.
    #[arg(long)]
    start_cleanup: bool,

    /// Run the cleanup pass after the wrapped command.
    #[arg(long)]
    end_cleanup: bool,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    /// Debug-level logging.
    #[arg(long)]
    debug: bool,

    /// Suppress non-error output.
    #[arg(short, long)]
    quiet: bool,

    /// The wrapped runner command and its arguments.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn log_level(args: &Args) -> &'static str {
    if args.quiet {
        "error"
    } else if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    }
}

fn cleanup(phase: &str) {
    // Placeholder pass: drop stale control sockets left by dead engines.
    let dir = std::env::temp_dir();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("tidepool-") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    debug!(phase, "cleanup pass finished");
}

fn main() -> ExitCode {
    // Exit 1 on unrecognized options, per the wrapper contract.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            // --help/--version print and succeed.
            if err.use_stderr() {
                eprintln!("{err}");
                return ExitCode::from(1);
            }
            print!("{err}");
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(&args))),
        )
        .init();

    if let Err(err) = tidepool_engine::init() {
        eprintln!("engine bootstrap failed: {err}");
        return ExitCode::from(1);
    }

    if args.start_cleanup {
        cleanup("start");
    }

    info!(command = ?args.command, "launching wrapped runner");
    let status = Command::new(&args.command[0])
        .args(&args.command[1..])
        .status();

    let code = match status {
        Ok(status) => status.code().unwrap_or(1),
        Err(err) => {
            eprintln!("failed to launch {}: {err}", args.command[0]);
            1
        }
    };

    if args.end_cleanup {
        cleanup("end");
    }

    // The wrapped runner's exit code is the wrapper's exit code.
    ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
}
