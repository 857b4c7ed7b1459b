//! Dialing a hop chain into live SSH sessions.
//!
//! The first hop is reached over a direct TCP connection; every subsequent
//! hop over a `direct-tcpip` channel of its predecessor, wrapped as a stream
//! and handshaked with `connect_stream` (SSH-over-SSH). On any failure every
//! session opened so far is torn down in reverse order.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::Disconnect;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::agent;
use super::client::ClientHandler;
use super::keys::AuthSource;
use super::resolver::{Hop, HopChain};
use crate::error::Error;
use crate::forwarding::remote::RemoteHook;

/// Live sessions for a dialed chain, bottom-up. `target` is the terminal
/// host where forwards are opened; `jumps` are kept only for teardown.
pub struct SessionChain {
    pub jumps: Vec<Handle<ClientHandler>>,
    pub target: Handle<ClientHandler>,
}

impl SessionChain {
    /// True while every session in the chain is still up.
    pub fn is_alive(&self) -> bool {
        !self.target.is_closed() && !self.jumps.iter().any(|j| j.is_closed())
    }

    /// Disconnect top-down: target first, then each jump in reverse order.
    pub async fn close(&mut self) {
        let _ = self
            .target
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        for jump in self.jumps.iter_mut().rev() {
            let _ = jump
                .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
                .await;
        }
    }
}

/// Dial every hop of `chain`. The remote hook is installed only on the
/// terminal hop's handler; jump hops never receive forwarded channels.
pub async fn dial(chain: &HopChain, remote: RemoteHook) -> Result<SessionChain, Error> {
    let Some(last) = chain.len().checked_sub(1) else {
        return Err(Error::Network("empty hop chain".to_string()));
    };

    let mut handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(chain.len());
    let mut stream: Option<russh::ChannelStream<client::Msg>> = None;

    for (i, hop) in chain.iter().enumerate() {
        let hook = if i == last {
            remote.clone()
        } else {
            RemoteHook::default()
        };

        let result = async {
            let mut handle = match stream.take() {
                None => connect_direct(hop, hook).await?,
                Some(s) => connect_via_stream(hop, s, hook).await?,
            };
            authenticate(&mut handle, hop).await?;

            if i < last {
                let next = &chain[i + 1];
                debug!(
                    "{}: opening tunnel to next hop {}:{}",
                    hop.alias, next.hostname, next.port
                );
                let channel = handle
                    .channel_open_direct_tcpip(&*next.hostname, next.port as u32, "127.0.0.1", 0)
                    .await
                    .map_err(|e| {
                        Error::Network(format!(
                            "{}: failed to open tunnel to {}:{}: {}",
                            hop.alias, next.hostname, next.port, e
                        ))
                    })?;
                stream = Some(channel.into_stream());
            }
            Ok::<_, Error>(handle)
        }
        .await;

        match result {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                teardown(&mut handles).await;
                return Err(e);
            }
        }
    }

    let Some(target) = handles.pop() else {
        return Err(Error::Network("empty hop chain".to_string()));
    };
    Ok(SessionChain {
        jumps: handles,
        target,
    })
}

async fn teardown(handles: &mut [Handle<ClientHandler>]) {
    for handle in handles.iter_mut().rev() {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "dial failed", "en")
            .await;
    }
}

fn ssh_config(hop: &Hop) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred: hop.preferred(),
        ..Default::default()
    })
}

/// Direct TCP connection + SSH handshake for the first hop.
async fn connect_direct(hop: &Hop, hook: RemoteHook) -> Result<Handle<ClientHandler>, Error> {
    let addr = format!("{}:{}", hop.hostname, hop.port);
    let socket_addr = addr
        .to_socket_addrs()
        .map_err(|e| Error::Network(format!("{}: failed to resolve {}: {}", hop.alias, addr, e)))?
        .next()
        .ok_or_else(|| Error::Network(format!("{}: no address found for {}", hop.alias, addr)))?;

    info!("{}: connecting to {}", hop.alias, addr);
    let handler = ClientHandler::new(hop.hostname.clone(), hop.port, hop.policy.clone(), hook);

    let handle = timeout(
        hop.timeout,
        client::connect(ssh_config(hop), socket_addr, handler),
    )
    .await
    .map_err(|_| Error::Timeout(format!("{}: connection to {} timed out", hop.alias, addr)))?
    .map_err(|e| match e {
        e @ Error::HostKey(_) => e,
        e => Error::Network(format!("{}: {}", hop.alias, e)),
    })?;

    debug!("{}: SSH handshake completed", hop.alias);
    Ok(handle)
}

/// SSH handshake over a channel stream of the previous hop.
async fn connect_via_stream(
    hop: &Hop,
    stream: russh::ChannelStream<client::Msg>,
    hook: RemoteHook,
) -> Result<Handle<ClientHandler>, Error> {
    info!(
        "{}: connecting via stream to {}:{}",
        hop.alias, hop.hostname, hop.port
    );
    let handler = ClientHandler::new(hop.hostname.clone(), hop.port, hop.policy.clone(), hook);

    let handle = timeout(
        hop.timeout,
        client::connect_stream(ssh_config(hop), stream, handler),
    )
    .await
    .map_err(|_| {
        Error::Timeout(format!(
            "{}: connection to {}:{} via stream timed out",
            hop.alias, hop.hostname, hop.port
        ))
    })?
    .map_err(|e| match e {
        e @ Error::HostKey(_) => e,
        e => Error::Network(format!("{}: {}", hop.alias, e)),
    })?;

    debug!("{}: SSH handshake via stream completed", hop.alias);
    Ok(handle)
}

/// Try each auth source in order until the server accepts one.
async fn authenticate(handle: &mut Handle<ClientHandler>, hop: &Hop) -> Result<(), Error> {
    let mut agent_conn = None;
    let mut last_rejection: Option<String> = None;

    for source in &hop.auth {
        let result = match source {
            AuthSource::Key(key) => {
                // The hash override only applies to RSA signatures.
                let hash = match key.algorithm() {
                    russh::keys::Algorithm::Rsa { .. } => {
                        handle.best_supported_rsa_hash().await.ok().flatten().flatten()
                    }
                    _ => None,
                };
                handle
                    .authenticate_publickey(
                        &hop.user,
                        PrivateKeyWithHashAlg::new(key.clone(), hash),
                    )
                    .await
            }
            AuthSource::Agent(public_key) => {
                if agent_conn.is_none() {
                    match agent::connect().await {
                        Ok(a) => agent_conn = Some(a),
                        Err(e) => {
                            warn!("{}: {}", hop.alias, e);
                            continue;
                        }
                    }
                }
                let Some(agent) = agent_conn.as_mut() else {
                    continue;
                };
                let hash = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
                handle
                    .authenticate_publickey_with(&hop.user, public_key.clone(), hash, agent)
                    .await
                    .map_err(|e| match e {
                        russh::AgentAuthError::Send(_) => russh::Error::SendError,
                        russh::AgentAuthError::Key(k) => russh::Error::Keys(k),
                    })
            }
        };

        match result {
            Ok(r) if r.success() => {
                info!("{}: authenticated as {}", hop.alias, hop.user);
                return Ok(());
            }
            Ok(_) => {
                debug!("{}: key rejected, trying next", hop.alias);
                last_rejection = Some("key rejected by server".to_string());
            }
            Err(e) => {
                debug!("{}: auth attempt failed: {}", hop.alias, e);
                last_rejection = Some(e.to_string());
            }
        }
    }

    Err(Error::Auth(format!(
        "{}: authentication failed: {}",
        hop.alias,
        last_rejection.unwrap_or_else(|| "no auth sources available".to_string())
    )))
}
