//! Per-tunnel supervisor: drives the state machine, owns the SSH sessions
//! and the forwarding engine's listener.
//!
//! One supervisor task per tunnel. It reacts to exactly two events: the
//! tunnel's shutdown signal (Close) and loss of the SSH session. There is no
//! automatic reconnect; a lost session moves the tunnel to Failed with a
//! diagnostic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{TunnelDesc, TunnelMode, TunnelState};
use crate::error::Error;
use crate::forwarding::local::{self, LocalAction};
use crate::forwarding::remote::{RemoteAction, RemoteContext, RemoteHook};
use crate::forwarding::{wait_for_drain, ConnStats, Endpoint, Listener};
use crate::ssh::{self, SessionController, SshConfig};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running tunnel, owned by the daemon's registry.
pub struct Tunnel {
    desc: TunnelDesc,
    state_rx: watch::Receiver<TunnelState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Tunnel {
    /// Resolve, dial and start forwarding. Returns only once the listener is
    /// established and accepting (or the remote forward is acknowledged).
    pub async fn open(desc: TunnelDesc) -> Result<Tunnel, Error> {
        let (local_ep, remote_ep) = mode_endpoints(&desc)?;

        let (state_tx, state_rx) = watch::channel(TunnelState::Pending);
        let (shutdown_tx, _) = broadcast::channel(1);

        state_tx.send_replace(TunnelState::Connecting);
        // An explicit user or identity bypasses the SSH config entirely.
        let chain = if desc.user.is_some() || desc.identity.is_some() {
            ssh::literal_chain(&desc.host, desc.user.as_deref(), desc.identity.as_deref())
                .await?
        } else {
            ssh::Resolver::new(SshConfig::load(None)?)
                .resolve(&desc.host)
                .await?
        };

        let remote_hook = RemoteHook::default();
        let sessions = ssh::dial(&chain, remote_hook.clone()).await?;
        let controller = ssh::spawn_session_task(sessions);

        let stats = Arc::new(ConnStats::default());
        let mut accept_task: Option<JoinHandle<()>> = None;
        let mut cancel_forward: Option<(String, u32)> = None;

        let setup = setup_forwarding(
            &desc,
            local_ep,
            remote_ep,
            &controller,
            &remote_hook,
            &shutdown_tx,
            &stats,
        )
        .await;
        match setup {
            Ok(ForwardSetup::Listener(task)) => accept_task = Some(task),
            Ok(ForwardSetup::RemoteForward(addr, port)) => {
                cancel_forward = Some((addr, port));
            }
            Err(e) => {
                controller.disconnect().await;
                return Err(e);
            }
        }

        state_tx.send_replace(TunnelState::Open);
        info!("tunnel '{}' open ({})", desc.name, desc.forward_desc());

        tokio::spawn(supervise(
            desc.name.clone(),
            state_tx,
            shutdown_tx.clone(),
            controller,
            accept_task,
            cancel_forward,
            stats,
        ));

        Ok(Tunnel {
            desc,
            state_rx,
            shutdown_tx,
        })
    }

    pub fn desc(&self) -> &TunnelDesc {
        &self.desc
    }

    pub fn state(&self) -> TunnelState {
        *self.state_rx.borrow()
    }

    /// Observe state transitions; used by the daemon to reap dead tunnels.
    pub fn watch(&self) -> watch::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    /// Signal shutdown and wait until every socket is released.
    pub async fn close(&self) -> Result<(), Error> {
        let _ = self.shutdown_tx.send(());
        let mut rx = self.state_rx.clone();
        loop {
            if rx.borrow_and_update().is_terminal() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                // Supervisor gone; its last published state decides.
                return if rx.borrow().is_terminal() {
                    Ok(())
                } else {
                    Err(Error::Network("tunnel supervisor vanished".to_string()))
                };
            }
        }
    }

    /// Test-only constructor with a fixed state.
    #[cfg(test)]
    pub(crate) fn stub(desc: TunnelDesc, state: TunnelState) -> Tunnel {
        let (state_tx, state_rx) = watch::channel(state);
        let (shutdown_tx, _) = broadcast::channel(1);
        // Keep the sender alive so state() stays readable.
        std::mem::forget(state_tx);
        Tunnel {
            desc,
            state_rx,
            shutdown_tx,
        }
    }
}

enum ForwardSetup {
    Listener(JoinHandle<()>),
    RemoteForward(String, u32),
}

async fn setup_forwarding(
    desc: &TunnelDesc,
    local_ep: Option<Endpoint>,
    remote_ep: Option<Endpoint>,
    controller: &SessionController,
    remote_hook: &RemoteHook,
    shutdown_tx: &broadcast::Sender<()>,
    stats: &Arc<ConnStats>,
) -> Result<ForwardSetup, Error> {
    match desc.mode {
        TunnelMode::Local | TunnelMode::Socks => {
            let Some(bind_ep) = local_ep else {
                return Err(missing_endpoint(desc, "local"));
            };
            let action = match desc.mode {
                TunnelMode::Local => {
                    let Some(target) = remote_ep else {
                        return Err(missing_endpoint(desc, "remote"));
                    };
                    LocalAction::Forward(target)
                }
                _ => LocalAction::Socks,
            };
            let listener = Listener::bind(&bind_ep).await?;
            info!("tunnel '{}': listening on {}", desc.name, listener.local_desc());
            Ok(ForwardSetup::Listener(tokio::spawn(local::run(
                listener,
                action,
                controller.clone(),
                shutdown_tx.subscribe(),
                stats.clone(),
            ))))
        }
        TunnelMode::Remote | TunnelMode::SocksRemote => {
            let Some(listen_ep) = remote_ep else {
                return Err(missing_endpoint(desc, "remote"));
            };
            let Some((host, port)) = listen_ep.tcp() else {
                return Err(Error::Config(format!(
                    "tunnel '{}': unix sockets are not supported for remote listeners",
                    desc.name
                )));
            };
            let action = match desc.mode {
                TunnelMode::Remote => {
                    let Some(target) = local_ep else {
                        return Err(missing_endpoint(desc, "local"));
                    };
                    RemoteAction::Dial(target)
                }
                _ => RemoteAction::Socks,
            };
            *remote_hook.write() = Some(RemoteContext {
                action,
                stats: stats.clone(),
                shutdown: shutdown_tx.clone(),
            });

            let bound = controller
                .tcpip_forward(host, port as u32)
                .await
                .map_err(|e| {
                    Error::Network(format!(
                        "tunnel '{}': remote forward on {listen_ep} rejected: {e}",
                        desc.name
                    ))
                })?;
            info!(
                "tunnel '{}': remote side listening on {}:{}",
                desc.name, host, bound
            );
            Ok(ForwardSetup::RemoteForward(host.to_string(), bound))
        }
    }
}

/// Supervisor body: wait for Close or session death, then tear down in
/// order and publish the terminal state.
async fn supervise(
    name: String,
    state_tx: watch::Sender<TunnelState>,
    shutdown_tx: broadcast::Sender<()>,
    controller: SessionController,
    accept_task: Option<JoinHandle<()>>,
    cancel_forward: Option<(String, u32)>,
    stats: Arc<ConnStats>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut disconnect_rx = controller.subscribe_disconnect();

    tokio::select! {
        _ = shutdown_rx.recv() => {
            state_tx.send_replace(TunnelState::Closing);
            if let Some((addr, port)) = cancel_forward {
                if let Err(e) = controller.cancel_tcpip_forward(&addr, port).await {
                    warn!("tunnel '{name}': failed to cancel remote forward: {e}");
                }
            }
            // Closing the sessions cancels in-flight copies; the accept loop
            // has already seen the same shutdown signal.
            controller.disconnect().await;
            wait_for_drain(&stats, DRAIN_TIMEOUT).await;
            if let Some(task) = accept_task {
                let _ = task.await;
            }
            info!("tunnel '{name}' closed");
            state_tx.send_replace(TunnelState::Closed);
        }
        _ = disconnect_rx.recv() => {
            warn!("tunnel '{name}': SSH session lost");
            // Stop the listener and unwind whatever is still in flight.
            let _ = shutdown_tx.send(());
            wait_for_drain(&stats, DRAIN_TIMEOUT).await;
            if let Some(task) = accept_task {
                let _ = task.await;
            }
            state_tx.send_replace(TunnelState::Failed);
        }
    }
}

fn mode_endpoints(desc: &TunnelDesc) -> Result<(Option<Endpoint>, Option<Endpoint>), Error> {
    let parse = |value: &Option<String>, which: &str| -> Result<Option<Endpoint>, Error> {
        match value {
            Some(v) => Endpoint::parse(v)
                .map(Some)
                .map_err(|e| Error::Config(format!("tunnel '{}': {which}: {e}", desc.name))),
            None => Ok(None),
        }
    };
    let local = parse(&desc.local, "local endpoint")?;
    let remote = parse(&desc.remote, "remote endpoint")?;

    let (need_local, need_remote) = match desc.mode {
        TunnelMode::Local | TunnelMode::Remote => (true, true),
        TunnelMode::Socks => (true, false),
        TunnelMode::SocksRemote => (false, true),
    };
    if need_local && local.is_none() {
        return Err(missing_endpoint(desc, "local"));
    }
    if need_remote && remote.is_none() {
        return Err(missing_endpoint(desc, "remote"));
    }
    Ok((local, remote))
}

fn missing_endpoint(desc: &TunnelDesc, which: &str) -> Error {
    Error::Config(format!(
        "tunnel '{}': mode '{}' requires a {} endpoint",
        desc.name, desc.mode, which
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(mode: TunnelMode, local: Option<&str>, remote: Option<&str>) -> TunnelDesc {
        TunnelDesc {
            name: "t".to_string(),
            mode,
            local: local.map(str::to_string),
            remote: remote.map(str::to_string),
            host: "h".to_string(),
            user: None,
            identity: None,
        }
    }

    #[test]
    fn test_mode_endpoint_requirements() {
        assert!(mode_endpoints(&desc(TunnelMode::Local, Some("9000"), Some("9000"))).is_ok());
        assert!(mode_endpoints(&desc(TunnelMode::Local, Some("9000"), None)).is_err());
        assert!(mode_endpoints(&desc(TunnelMode::Socks, Some("1080"), None)).is_ok());
        assert!(mode_endpoints(&desc(TunnelMode::Socks, None, None)).is_err());
        assert!(mode_endpoints(&desc(TunnelMode::SocksRemote, None, Some("1080"))).is_ok());
        assert!(mode_endpoints(&desc(TunnelMode::Remote, None, Some("9000"))).is_err());
    }

    #[test]
    fn test_endpoint_parse_errors_name_the_tunnel() {
        let err = mode_endpoints(&desc(TunnelMode::Local, Some("not an endpoint"), None))
            .unwrap_err();
        assert!(err.to_string().contains("tunnel 't'"));
    }
}
