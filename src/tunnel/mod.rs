//! Tunnel descriptions, lifecycle states, supervisor and registry.

mod registry;
mod supervisor;

pub use registry::Registry;
pub use supervisor::Tunnel;

use serde::{Deserialize, Serialize};

/// Forwarding mode of a tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelMode {
    /// Listen locally, dial the remote endpoint through SSH.
    #[default]
    Local,
    /// Listen on the remote host, dial the local endpoint from here.
    Remote,
    /// Local SOCKS5 proxy tunneled through SSH.
    Socks,
    /// SOCKS5 proxy listening on the remote host, served from here.
    SocksRemote,
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelMode::Local => "local",
            TunnelMode::Remote => "remote",
            TunnelMode::Socks => "socks",
            TunnelMode::SocksRemote => "socks-remote",
        };
        f.write_str(s)
    }
}

/// Everything needed to open one tunnel. Read from the configuration file by
/// the client and shipped to the daemon unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDesc {
    /// Unique tunnel name.
    pub name: String,
    #[serde(default)]
    pub mode: TunnelMode,
    /// Local endpoint: bare port, `host:port`, `[v6]:port` or a socket path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    /// Remote endpoint, same grammar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// SSH config alias or literal hostname.
    pub host: String,
    /// Explicit user; bypasses the SSH config when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Explicit identity file; bypasses the SSH config when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl TunnelDesc {
    /// Short human description of the forward, e.g. `9000 -> localhost:9000`.
    pub fn forward_desc(&self) -> String {
        match self.mode {
            TunnelMode::Local => format!(
                "{} -> {}",
                self.local.as_deref().unwrap_or("?"),
                self.remote.as_deref().unwrap_or("?")
            ),
            TunnelMode::Remote => format!(
                "{} <- {}",
                self.local.as_deref().unwrap_or("?"),
                self.remote.as_deref().unwrap_or("?")
            ),
            TunnelMode::Socks => format!("socks5 on {}", self.local.as_deref().unwrap_or("?")),
            TunnelMode::SocksRemote => {
                format!("socks5 on remote {}", self.remote.as_deref().unwrap_or("?"))
            }
        }
    }
}

/// Lifecycle of a tunnel.
///
/// Pending -> Connecting -> Open, any -> Closing -> Closed,
/// Connecting -> Failed. Only Open tunnels are listed as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Pending,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl TunnelState {
    /// Terminal states: the supervisor is gone and all resources released.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde_names() {
        assert_eq!(
            serde_json::to_string(&TunnelMode::SocksRemote).unwrap(),
            "\"socks-remote\""
        );
        let m: TunnelMode = serde_json::from_str("\"socks\"").unwrap();
        assert_eq!(m, TunnelMode::Socks);
    }

    #[test]
    fn test_desc_mode_defaults_to_local() {
        let desc: TunnelDesc = serde_json::from_str(
            r#"{"name":"dev","local":"9000","remote":"localhost:9000","host":"dev-server"}"#,
        )
        .unwrap();
        assert_eq!(desc.mode, TunnelMode::Local);
        assert_eq!(desc.forward_desc(), "9000 -> localhost:9000");
    }
}
