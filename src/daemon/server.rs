//! Control socket server: accept loop and command dispatch.

use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::proto::{self, Cmd, CmdKind, Resp};
use super::Paths;
use crate::error::Error;
use crate::tunnel::{Registry, Tunnel, TunnelDesc};

/// Run the daemon until killed. The first act is binding the socket, which
/// doubles as the single-instance lock: if another daemon already answers on
/// the path, startup fails and the racing client connects to it instead.
pub async fn run(paths: &Paths) -> Result<(), Error> {
    let listener = bind_socket(paths)?;
    info!("daemon listening on {}", paths.sock.display());

    let registry = Arc::new(Registry::new());
    loop {
        let (stream, _) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(handle_connection(stream, registry));
    }
}

fn bind_socket(paths: &Paths) -> Result<UnixListener, Error> {
    if paths.sock.exists() {
        // A live socket means another daemon owns the path; a dead one is
        // left over from a previous run and can be replaced.
        match std::os::unix::net::UnixStream::connect(&paths.sock) {
            Ok(_) => {
                return Err(Error::Network(format!(
                    "daemon already running on {}",
                    paths.sock.display()
                )))
            }
            Err(_) => {
                debug!("removing stale socket {}", paths.sock.display());
                std::fs::remove_file(&paths.sock)?;
            }
        }
    }
    Ok(UnixListener::bind(&paths.sock)?)
}

/// One request, one response, then the connection is done. A malformed frame
/// closes the connection without an answer; the daemon keeps serving.
async fn handle_connection(mut stream: UnixStream, registry: Arc<Registry>) {
    let cmd: Cmd = match proto::read_frame(&mut stream).await {
        Ok(cmd) => cmd,
        Err(e) => {
            warn!("dropping control connection: {e}");
            return;
        }
    };
    debug!("received {:?} command", cmd.kind);

    let resp = dispatch(cmd, &registry).await;
    if let Err(e) = proto::write_frame(&mut stream, &resp).await {
        warn!("failed to send response: {e}");
    }
}

async fn dispatch(cmd: Cmd, registry: &Arc<Registry>) -> Resp {
    match cmd.kind {
        CmdKind::Nop => Resp::ok(),
        CmdKind::List => Resp::with_tunnels(registry.running()),
        CmdKind::Open => match cmd.tunnel {
            Some(desc) => match open_tunnel(desc, registry).await {
                Ok(()) => Resp::ok(),
                Err(e) => Resp::err(e.to_string()),
            },
            None => Resp::err("Open requires a tunnel description"),
        },
        CmdKind::Close => match cmd.tunnel {
            Some(desc) => match close_tunnel(&desc.name, registry).await {
                Ok(()) => Resp::ok(),
                Err(e) => Resp::err(e.to_string()),
            },
            None => Resp::err("Close requires a tunnel name"),
        },
    }
}

async fn open_tunnel(desc: TunnelDesc, registry: &Arc<Registry>) -> Result<(), Error> {
    let name = desc.name.clone();
    if name.is_empty() {
        return Err(Error::Config("tunnel has no name".to_string()));
    }
    if registry.contains(&name) {
        return Err(Error::Config(format!("tunnel '{name}' is already running")));
    }

    info!("opening tunnel '{name}'");
    let tunnel = Arc::new(Tunnel::open(desc).await?);

    if !registry.insert(name.clone(), tunnel.clone()) {
        // Lost a race against a concurrent Open of the same name.
        let _ = tunnel.close().await;
        return Err(Error::Config(format!("tunnel '{name}' is already running")));
    }

    // Reap the entry once the tunnel reaches a terminal state, keeping the
    // registry equal to the set of live tunnels.
    let registry = registry.clone();
    tokio::spawn(async move {
        let mut state_rx = tunnel.watch();
        loop {
            if state_rx.borrow_and_update().is_terminal() {
                break;
            }
            if state_rx.changed().await.is_err() {
                break;
            }
        }
        registry.remove_entry(&name, &tunnel);
        debug!("tunnel '{name}' removed from registry");
    });

    Ok(())
}

async fn close_tunnel(name: &str, registry: &Arc<Registry>) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Config("tunnel has no name".to_string()));
    }
    let Some(tunnel) = registry.get(name) else {
        return Err(Error::Config(format!("no such tunnel: '{name}'")));
    };

    info!("closing tunnel '{name}'");
    tunnel.close().await?;
    registry.remove_entry(name, &tunnel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nop_does_not_change_state() {
        let registry = Arc::new(Registry::new());
        let resp = dispatch(
            Cmd {
                kind: CmdKind::Nop,
                tunnel: None,
            },
            &registry,
        )
        .await;
        assert!(resp.success);
        assert!(registry.running().is_empty());
    }

    #[tokio::test]
    async fn test_open_without_desc_fails() {
        let registry = Arc::new(Registry::new());
        let resp = dispatch(
            Cmd {
                kind: CmdKind::Open,
                tunnel: None,
            },
            &registry,
        )
        .await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn test_close_unknown_tunnel_fails() {
        let registry = Arc::new(Registry::new());
        let err = close_tunnel("ghost", &registry).await.unwrap_err();
        assert!(err.to_string().contains("no such tunnel"));
    }
}
