use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use boring::cli::{self, Cli};
use boring::daemon::{self, Paths};

#[tokio::main]
async fn main() -> ExitCode {
    let paths = Paths::from_env();

    // The daemon flag bypasses clap entirely: the daemonized child must
    // never trip over front-end argument handling.
    if std::env::args().any(|a| a == daemon::DAEMON_FLAG) {
        return run_daemon(&paths).await;
    }

    init_client_logging();
    let cli = Cli::parse();
    match cli::run(cli, &paths).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e}", "error:".red());
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(paths: &Paths) -> ExitCode {
    if let Err(e) = init_daemon_logging(paths) {
        eprintln!("could not open log file: {e}");
        return ExitCode::FAILURE;
    }
    match daemon::server::run(paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("daemon exited: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Daemon log: append-only plain text file, level via BORING_LOG.
fn init_daemon_logging(paths: &Paths) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Client log: warnings to stderr so command output stays clean.
fn init_client_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env("BORING_LOG").unwrap_or_else(|_| EnvFilter::new(default))
}
