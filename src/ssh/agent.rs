//! Bridge to a running ssh-agent.
//!
//! The agent is located through `SSH_AUTH_SOCK`. Keys held by the agent are
//! listed at resolution time and offered during authentication by delegating
//! the signature to the agent connection.

use russh::keys::agent::client::AgentClient;
use russh::keys::PublicKey;
use tokio::net::UnixStream;

use crate::error::Error;

/// Open a connection to the agent named by the environment.
pub async fn connect() -> Result<AgentClient<UnixStream>, Error> {
    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return Err(Error::Agent("SSH_AUTH_SOCK is not set".to_string()));
    }
    AgentClient::connect_env()
        .await
        .map_err(|e| Error::Agent(e.to_string()))
}

/// Public keys currently held by the agent.
pub async fn signers() -> Result<Vec<PublicKey>, Error> {
    let mut agent = connect().await?;
    agent
        .request_identities()
        .await
        .map_err(|e| Error::Agent(e.to_string()))
}
