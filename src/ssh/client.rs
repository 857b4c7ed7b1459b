//! russh client handler: host key verification and server-initiated channels.

use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use russh::Channel;
use tracing::{debug, info, warn};

use super::known_hosts::{HostKeyVerification, KnownHostsStore};
use crate::error::Error;
use crate::forwarding::remote::{self, RemoteHook};

/// How a hop verifies the server's host key.
#[derive(Clone, Debug)]
pub enum HostKeyPolicy {
    /// Verify against the known-hosts store built for this hop. Unknown and
    /// changed keys are rejected; nothing is ever recorded.
    Strict(Arc<KnownHostsStore>),
    /// Accept any key without recording it (StrictHostKeyChecking no/off).
    Permissive,
}

/// Per-session callback handler.
///
/// Besides key verification this handles `forwarded-tcpip` channels the
/// server opens for remote forwards; the hook is populated by the supervisor
/// once the tunnel's remote listener is requested.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    remote: RemoteHook,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, remote: RemoteHook) -> Self {
        Self {
            host,
            port,
            policy,
            remote,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let store = match &self.policy {
            HostKeyPolicy::Permissive => {
                debug!(
                    "accepting host key for {}:{} without verification",
                    self.host, self.port
                );
                return Ok(true);
            }
            HostKeyPolicy::Strict(store) => store,
        };

        match store.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => Err(Error::HostKey(format!(
                "unknown host key for {}:{} (fingerprint {}). Note that boring does not \
                 automatically add keys to your known_hosts.",
                self.host, self.port, fingerprint
            ))),
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(Error::HostKey(format!(
                "host key for {}:{} has changed! Expected {}, got {}. This could indicate \
                 a man-in-the-middle attack; if the change is legitimate, remove the old \
                 key from your known_hosts.",
                self.host, self.port, expected_fingerprint, actual_fingerprint
            ))),
        }
    }

    /// Called when the server opens a channel for an incoming connection on
    /// a remote forward. Dispatch is spawned; blocking here would stall the
    /// SSH event loop.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let ctx = self.remote.read().clone();
        match ctx {
            Some(ctx) => {
                tokio::spawn(remote::handle_forwarded(channel, ctx));
            }
            None => {
                warn!(
                    "dropping unexpected forwarded-tcpip channel for {}:{}",
                    connected_address, connected_port
                );
            }
        }
        Ok(())
    }
}
