//! Local-listener modes: plain forwards and the SOCKS5 proxy.
//!
//! One accept loop per tunnel; each accepted connection gets its own task
//! that opens a channel through the SSH session and runs the pump. The loop
//! stops on the tunnel's shutdown signal or when the SSH session dies; the
//! supervisor then drains the remaining connection tasks.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::socks;
use super::{BoxStream, ConnStats, Endpoint, Listener};
use crate::error::Error;
use crate::ssh::SessionController;

/// What to do with an accepted local connection.
#[derive(Clone)]
pub enum LocalAction {
    /// Open a channel to the fixed remote endpoint.
    Forward(Endpoint),
    /// Negotiate SOCKS5, then open a channel to the requested target.
    Socks,
}

/// Accept loop. Runs until shutdown or SSH disconnect.
pub async fn run(
    listener: Listener,
    action: LocalAction,
    ssh: SessionController,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<ConnStats>,
) {
    let desc = listener.local_desc();
    let mut disconnect_rx = ssh.subscribe_disconnect();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("listener on {desc} stopped by request");
                break;
            }
            _ = disconnect_rx.recv() => {
                debug!("listener on {desc} stopped: SSH disconnected");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        stats.enter();
                        let action = action.clone();
                        let ssh = ssh.clone();
                        let stats = stats.clone();
                        tokio::spawn(async move {
                            let result = serve_connection(stream, action, ssh).await;
                            stats.leave();
                            if let Err(e) = result {
                                warn!("forwarded connection error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error on {desc}: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    // Dropping the listener releases the port (and unlinks a Unix socket).
}

async fn serve_connection(
    mut stream: BoxStream,
    action: LocalAction,
    ssh: SessionController,
) -> Result<(), Error> {
    match action {
        LocalAction::Forward(endpoint) => {
            let channel = match &endpoint {
                Endpoint::Tcp { host, port } => {
                    ssh.open_direct_tcpip(host, *port as u32).await?
                }
                Endpoint::Unix(path) => {
                    ssh.open_direct_streamlocal(&path.to_string_lossy()).await?
                }
            };
            debug!("opened channel for forward to {endpoint}");
            super::pump::pump(stream, channel.into_stream()).await;
            Ok(())
        }
        LocalAction::Socks => {
            let (host, port) = socks::handshake(&mut stream).await?;
            debug!("SOCKS5: connecting to {host}:{port}");
            match ssh.open_direct_tcpip(&host, port as u32).await {
                Ok(channel) => {
                    socks::reply(&mut stream, socks::REP_SUCCESS).await?;
                    super::pump::pump(stream, channel.into_stream()).await;
                    Ok(())
                }
                Err(e) => {
                    warn!("SOCKS5: failed to reach {host}:{port}: {e}");
                    socks::reply(&mut stream, socks::REP_HOST_UNREACHABLE)
                        .await
                        .ok();
                    Err(e)
                }
            }
        }
    }
}
