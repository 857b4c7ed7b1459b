//! Daemon control plane: process paths, the single-instance `ensure`
//! protocol and the control socket server.

pub mod proto;
pub mod server;

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Error;

/// Argument that switches the binary into daemon mode.
pub const DAEMON_FLAG: &str = "--daemon";

const SOCK_NAME: &str = "boringd.sock";
const LOG_FILE_NAME: &str = "boringd.log";

/// Initial wait of the `ensure` backoff loop; doubles on every probe.
const INIT_WAIT: Duration = Duration::from_millis(2);

/// Ambient process paths, derived once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Paths {
    pub sock: PathBuf,
    pub log_file: PathBuf,
}

impl Paths {
    pub fn from_env() -> Paths {
        let sock = match std::env::var_os("BORING_SOCK") {
            Some(s) if !s.is_empty() => PathBuf::from(s),
            _ => std::env::temp_dir().join(SOCK_NAME),
        };
        let log_file = match std::env::var_os("BORING_LOG_FILE") {
            Some(s) if !s.is_empty() => PathBuf::from(s),
            _ => std::env::temp_dir().join(LOG_FILE_NAME),
        };
        Paths { sock, log_file }
    }
}

/// Connect to the daemon's control socket.
pub async fn connect(paths: &Paths) -> std::io::Result<UnixStream> {
    UnixStream::connect(&paths.sock).await
}

/// Make sure a daemon is running: probe the socket, start a daemonized child
/// on the first failure, and keep probing with exponential backoff until the
/// connection succeeds or the deadline passes.
pub async fn ensure(paths: &Paths, deadline: Duration) -> Result<(), Error> {
    let deadline = Instant::now() + deadline;
    let mut wait = INIT_WAIT;
    let mut starting = false;

    loop {
        if let Ok(conn) = connect(paths).await {
            drop(conn);
            return Ok(());
        }
        if !starting {
            debug!("daemon not reachable, starting it");
            start_daemon()?;
            starting = true;
        }
        if Instant::now() + wait > deadline {
            return Err(Error::Timeout(
                "daemon did not come up before the deadline".to_string(),
            ));
        }
        tokio::time::sleep(wait).await;
        wait *= 2;
    }
}

/// Re-execute this binary with the daemon flag, fully detached: no stdio, a
/// fresh session, and `/` as working directory. The child is not waited on.
fn start_daemon() -> Result<(), Error> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()
        .map_err(|e| Error::Config(format!("could not determine executable path: {e}")))?;

    Command::new(exe)
        .arg(DAEMON_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .current_dir("/")
        .process_group(0)
        .spawn()
        .map_err(|e| Error::Config(format!("failed to start daemon: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_default_to_tmp() {
        // Only exercise the fallback branch when the overrides are unset.
        if std::env::var_os("BORING_SOCK").is_none() {
            let paths = Paths::from_env();
            assert!(paths.sock.ends_with("boringd.sock"));
            assert!(paths.log_file.ends_with("boringd.log"));
        }
    }
}
