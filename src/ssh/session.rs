//! Single-owner task for a dialed session chain.
//!
//! Exactly one task owns the chain's `Handle`s; everything else talks to it
//! through a cloneable [`SessionController`] over an mpsc channel. This keeps
//! handles out of shared locks and gives forwarding tasks a broadcast signal
//! when the underlying SSH connection dies.

use std::time::Duration;

use russh::client::Msg;
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use super::dial::SessionChain;
use crate::error::Error;

enum SessionCommand {
    DirectTcpip {
        host: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    DirectStreamlocal {
        path: String,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },
    Disconnect {
        reply_tx: oneshot::Sender<()>,
    },
}

/// Handle for talking to the session owner task.
#[derive(Clone)]
pub struct SessionController {
    cmd_tx: mpsc::Sender<SessionCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl SessionController {
    /// Receives `()` once when the SSH connection is lost.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    async fn send<T>(
        &self,
        cmd: SessionCommand,
        reply_rx: oneshot::Receiver<Result<T, russh::Error>>,
    ) -> Result<T, Error> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::Network("SSH session is closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Network("SSH session is closed".to_string()))?
            .map_err(Error::from)
    }

    /// Open a `direct-tcpip` channel from the terminal host.
    pub async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<Channel<Msg>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            SessionCommand::DirectTcpip {
                host: host.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Open a channel to a Unix socket on the terminal host.
    pub async fn open_direct_streamlocal(&self, path: &str) -> Result<Channel<Msg>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            SessionCommand::DirectStreamlocal {
                path: path.to_string(),
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Ask the server to listen on `address:port`; returns the bound port.
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            SessionCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(
            SessionCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Disconnect the whole chain, target first. Returns once the owner task
    /// has sent the disconnect messages.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Disconnect { reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Spawn the owner task for `chain` and return its controller.
pub fn spawn_session_task(chain: SessionChain) -> SessionController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(16);
    let (disconnect_tx, _) = broadcast::channel(1);
    let death_tx = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut chain = chain;
        let mut liveness = tokio::time::interval(Duration::from_secs(5));
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        // All controllers dropped: tunnel is gone.
                        chain.close().await;
                        break;
                    };
                    match cmd {
                        SessionCommand::DirectTcpip { host, port, reply_tx } => {
                            let r = chain
                                .target
                                .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
                                .await;
                            let _ = reply_tx.send(r);
                        }
                        SessionCommand::DirectStreamlocal { path, reply_tx } => {
                            let r = chain.target.channel_open_direct_streamlocal(path).await;
                            let _ = reply_tx.send(r);
                        }
                        SessionCommand::TcpipForward { address, port, reply_tx } => {
                            let r = chain.target.tcpip_forward(address, port).await;
                            let _ = reply_tx.send(r);
                        }
                        SessionCommand::CancelTcpipForward { address, port, reply_tx } => {
                            let r = chain.target.cancel_tcpip_forward(address, port).await;
                            let _ = reply_tx.send(r);
                        }
                        SessionCommand::Disconnect { reply_tx } => {
                            chain.close().await;
                            let _ = reply_tx.send(());
                            break;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if !chain.is_alive() {
                        warn!("SSH session lost");
                        let _ = death_tx.send(());
                        break;
                    }
                }
            }
        }
        debug!("session owner task exited");
    });

    SessionController {
        cmd_tx,
        disconnect_tx,
    }
}
