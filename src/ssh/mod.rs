//! SSH connection assembly: config resolution, keys, host key verification,
//! chain dialing and session ownership.

pub mod agent;
mod algorithms;
mod client;
mod dial;
mod keys;
pub mod known_hosts;
mod resolver;
mod session;
pub mod ssh_config;

pub use client::{ClientHandler, HostKeyPolicy};
pub use dial::{dial, SessionChain};
pub use keys::AuthSource;
pub use resolver::{
    literal_chain, Hop, HopChain, JumpSpec, KeyCheck, Resolver, MAX_JUMP_RECURSIONS,
    SSH_CONNECT_TIMEOUT,
};
pub use session::{spawn_session_task, SessionController};
pub use ssh_config::SshConfig;
