//! Error types shared across the crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unparseable configuration: SSH config values, jump
    /// specifications, endpoint strings, tunnel descriptions.
    #[error("{0}")]
    Config(String),

    /// No usable signers, or every offered key was rejected by the server.
    #[error("{0}")]
    Auth(String),

    /// TCP dial failure, SSH handshake failure or a lost session.
    #[error("{0}")]
    Network(String),

    /// Host key verification failure.
    #[error("{0}")]
    HostKey(String),

    /// Malformed control-plane frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("key error: {0}")]
    Key(String),

    #[error("ssh-agent error: {0}")]
    Agent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Key(err.to_string())
    }
}
