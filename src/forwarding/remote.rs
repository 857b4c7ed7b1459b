//! Remote-listener modes: reverse forwards and the reverse SOCKS5 proxy.
//!
//! The listener lives on the SSH server (requested with `tcpip-forward`);
//! each incoming connection arrives as a `forwarded-tcpip` channel through
//! the session's [`ClientHandler`](crate::ssh::ClientHandler), which looks
//! up the tunnel's context here and spawns the connection task.

use std::sync::Arc;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::socks;
use super::{ConnStats, Endpoint};
use crate::error::Error;

/// What to do with an incoming forwarded channel.
#[derive(Clone)]
pub enum RemoteAction {
    /// Dial the fixed local endpoint from this process.
    Dial(Endpoint),
    /// Serve SOCKS5 on the channel and dial the requested target locally.
    Socks,
}

/// Context installed by the supervisor before the remote listener is
/// requested; cleared implicitly when the session ends.
#[derive(Clone)]
pub struct RemoteContext {
    pub action: RemoteAction,
    pub stats: Arc<ConnStats>,
    pub shutdown: broadcast::Sender<()>,
}

/// Slot the session handler reads on every forwarded channel. Empty on jump
/// hops and on tunnels without a remote listener.
pub type RemoteHook = Arc<RwLock<Option<RemoteContext>>>;

/// Entry point called from the session handler for each incoming channel.
pub async fn handle_forwarded(channel: Channel<Msg>, ctx: RemoteContext) {
    ctx.stats.enter();
    let mut shutdown_rx = ctx.shutdown.subscribe();

    let result = tokio::select! {
        r = serve_channel(channel, ctx.action) => r,
        _ = shutdown_rx.recv() => {
            debug!("forwarded connection cancelled by tunnel close");
            Ok(())
        }
    };

    ctx.stats.leave();
    if let Err(e) = result {
        warn!("forwarded connection error: {e}");
    }
}

async fn serve_channel(channel: Channel<Msg>, action: RemoteAction) -> Result<(), Error> {
    match action {
        RemoteAction::Dial(endpoint) => {
            let local = endpoint.connect().await.map_err(|e| {
                Error::Network(format!("failed to dial local endpoint {endpoint}: {e}"))
            })?;
            debug!("relaying forwarded connection to {endpoint}");
            super::pump::pump(channel.into_stream(), local).await;
            Ok(())
        }
        RemoteAction::Socks => {
            let mut stream = channel.into_stream();
            let (host, port) = socks::handshake(&mut stream).await?;
            debug!("reverse SOCKS5: dialing {host}:{port} locally");
            let target = Endpoint::Tcp {
                host: host.clone(),
                port,
            };
            match target.connect().await {
                Ok(local) => {
                    socks::reply(&mut stream, socks::REP_SUCCESS).await?;
                    super::pump::pump(stream, local).await;
                    Ok(())
                }
                Err(e) => {
                    warn!("reverse SOCKS5: failed to reach {host}:{port}: {e}");
                    socks::reply(&mut stream, socks::REP_HOST_UNREACHABLE)
                        .await
                        .ok();
                    Err(Error::Network(format!(
                        "failed to dial {host}:{port}: {e}"
                    )))
                }
            }
        }
    }
}
