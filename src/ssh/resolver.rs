//! Alias resolution: SSH config lookup → ordered, dialable hop chain.
//!
//! `resolve` expands an alias into the chain of hops needed to reach it:
//! jump hosts named by ProxyJump come first (depth-first, left to right), the
//! terminal host last. Only the first jump of a parent may contribute its own
//! jumps; later jumps are resolved with ProxyJump suppressed, matching ssh(1)
//! hop expansion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::algorithms;
use super::client::HostKeyPolicy;
use super::keys::{self, AuthSource};
use super::known_hosts::KnownHostsStore;
use super::ssh_config::SshConfig;
use crate::error::Error;
use crate::paths::{expand_tilde, Subst};

/// Wall-clock cap for TCP connect + SSH handshake per hop.
pub const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backstop against cyclic or runaway ProxyJump definitions.
pub const MAX_JUMP_RECURSIONS: usize = 20;

const HOSTNAME_TOKENS: &[&str] = &["%%", "%h"];
const PROXY_TOKENS: &[&str] = &["%%", "%h", "%n", "%p", "%r"];
const IDENT_TOKENS: &[&str] = &[
    "%%", "%d", "%h", "%i", "%j", "%k", "%L", "%l", "%n", "%p", "%r", "%u",
];

/// Host key checking mode parsed from StrictHostKeyChecking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCheck {
    /// Reject hosts the known-hosts files cannot verify. Corresponds to the
    /// "yes" and "ask" options; "ask" is treated as "yes" because this tool
    /// never prompts.
    Strict,
    /// Accept any host key without recording it ("no"/"off").
    Off,
}

/// A parsed ProxyJump element: `[user@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpSpec {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl JumpSpec {
    pub fn parse(s: &str) -> Result<Self, Error> {
        let (user, host_port) = match s.split_once('@') {
            Some((u, rest)) if !u.is_empty() => (Some(u.to_string()), rest),
            Some((_, rest)) => (None, rest),
            None => (None, s),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid jump port '{p}'")))?;
                (h, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("empty host in jump spec '{s}'")));
        }
        Ok(JumpSpec {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Per-alias values read from the SSH config, after token substitution.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub alias: String,
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub key_check: KeyCheck,
    pub identity_files: Vec<String>,
    pub known_hosts_files: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub host_key_algos: Vec<String>,
    pub kex_algos: Vec<String>,
    pub jumps: Vec<JumpSpec>,
}

impl HostConfig {
    /// Like ssh(1), fall back to the local user when none is configured.
    fn ensure_user(&mut self) {
        if self.user.is_empty() {
            self.user = local_user();
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.hostname.is_empty() {
            return Err(Error::Config(format!("{}: no host specified", self.alias)));
        }
        if self.user.is_empty() {
            return Err(Error::Config(format!("{}: no user specified", self.alias)));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("{}: no port specified", self.alias)));
        }
        Ok(())
    }
}

/// One fully resolved connection step, ready to dial.
#[derive(Debug)]
pub struct Hop {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: Vec<AuthSource>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub kex_algos: Vec<String>,
    /// In strict mode, already narrowed to what known_hosts can verify.
    pub host_key_algos: Vec<String>,
    pub policy: HostKeyPolicy,
    pub timeout: Duration,
}

impl Hop {
    pub(crate) fn preferred(&self) -> russh::Preferred {
        algorithms::preferred(
            &self.ciphers,
            &self.macs,
            &self.kex_algos,
            &self.host_key_algos,
        )
    }
}

/// Ordered hop sequence; the last element is the terminal host.
pub type HopChain = Vec<Hop>;

/// Resolves aliases against a parsed SSH config.
pub struct Resolver {
    config: SshConfig,
}

impl Resolver {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Resolve `alias` into a complete hop chain.
    pub async fn resolve(&self, alias: &str) -> Result<HopChain, Error> {
        let mut configs = Vec::new();
        self.chain_configs(self.parse_alias(alias)?, false, 0, &mut configs)?;

        let mut hops = Vec::with_capacity(configs.len());
        for hc in configs {
            hops.push(make_hop(hc).await?);
        }
        Ok(hops)
    }

    /// Expand jump hosts depth-first into `out`, terminal host last.
    fn chain_configs(
        &self,
        mut hc: HostConfig,
        ignore_jumps: bool,
        depth: usize,
        out: &mut Vec<HostConfig>,
    ) -> Result<(), Error> {
        if depth > MAX_JUMP_RECURSIONS {
            return Err(Error::Config(
                "maximum jump recursions exceeded".to_string(),
            ));
        }

        hc.ensure_user();
        hc.validate()?;
        if ignore_jumps {
            hc.jumps.clear();
        }

        let jumps = std::mem::take(&mut hc.jumps);
        for (i, jump) in jumps.iter().enumerate() {
            let mut jc = self
                .parse_alias(&jump.host)
                .map_err(|e| Error::Config(format!("could not resolve jump host: {e}")))?;

            // Inline user and port override the jump's own config.
            if let Some(user) = &jump.user {
                jc.user = user.clone();
            }
            if let Some(port) = jump.port {
                jc.port = port;
            }
            // If the config gave no hostname, take the jump spec literally.
            if jc.hostname.is_empty() {
                jc.hostname = jump.host.clone();
            }

            // Only the first jump contributes its own jumps; the rest are
            // reached through the already-established chain. This mirrors
            // ssh(1) ProxyJump expansion.
            self.chain_configs(jc, i != 0, depth + 1, out)?;
        }

        out.push(hc);
        Ok(())
    }

    /// Read and substitute every recognized key for `alias`.
    pub fn parse_alias(&self, alias: &str) -> Result<HostConfig, Error> {
        let cfg = &self.config;
        let mut sub = base_subst(alias);

        let hostname = sub.apply(&cfg.get(alias, "HostName"), HOSTNAME_TOKENS);
        sub.bind("%h", &hostname);

        let user = cfg.get(alias, "User");
        sub.bind("%r", &user);

        let port: u16 = cfg.get(alias, "Port").parse().unwrap_or(0);
        sub.bind("%p", port.to_string());

        let key_check = match cfg.get(alias, "StrictHostKeyChecking").as_str() {
            "yes" | "ask" => KeyCheck::Strict,
            "no" | "off" => KeyCheck::Off,
            "accept-new" => {
                warn!("StrictHostKeyChecking 'accept-new' not supported, using 'yes'");
                KeyCheck::Strict
            }
            other => {
                return Err(Error::Config(format!(
                    "{alias}: unsupported StrictHostKeyChecking option '{other}'"
                )))
            }
        };

        let ciphers = split_commas(&cfg.get(alias, "Ciphers"));
        let macs = split_commas(&cfg.get(alias, "MACs"));
        let host_key_algos = split_commas(&cfg.get(alias, "HostKeyAlgorithms"));
        let kex_algos = split_commas(&cfg.get(alias, "KexAlgorithms"));

        let proxy = sub.apply(&cfg.get(alias, "ProxyJump"), PROXY_TOKENS);
        sub.bind("%j", &proxy);
        let mut jumps = Vec::new();
        if !proxy.is_empty() && proxy != "none" {
            for j in proxy.split(',') {
                jumps.push(JumpSpec::parse(j.trim()).map_err(|e| {
                    Error::Config(format!("{alias}: could not parse jump host: {e}"))
                })?);
            }
        }

        let identity_files = sub.apply_all(cfg.get_all(alias, "IdentityFile"), IDENT_TOKENS);

        let mut hosts = cfg.get_all(alias, "GlobalKnownHostsFile");
        hosts.extend(sub.apply_all(cfg.get_all(alias, "UserKnownHostsFile"), IDENT_TOKENS));
        let known_hosts_files = hosts
            .iter()
            .flat_map(|h| h.split_whitespace().map(str::to_string))
            .collect();

        Ok(HostConfig {
            alias: alias.to_string(),
            hostname,
            user,
            port,
            key_check,
            identity_files,
            known_hosts_files,
            ciphers,
            macs,
            host_key_algos,
            kex_algos,
            jumps,
        })
    }
}

/// Build the single-hop chain for a tunnel that carries explicit overrides:
/// the SSH config is not consulted at all. With an explicit identity only
/// that key is offered; otherwise the usual default-key/agent fallback runs.
pub async fn literal_chain(
    host: &str,
    user: Option<&str>,
    identity: Option<&str>,
) -> Result<HopChain, Error> {
    let user = match user {
        Some(u) => u.to_string(),
        None => local_user(),
    };
    if user.is_empty() {
        return Err(Error::Config(format!("{host}: no user specified")));
    }

    let identity_files: Vec<String> = identity.iter().map(|i| i.to_string()).collect();
    let hc = HostConfig {
        alias: host.to_string(),
        hostname: host.to_string(),
        user,
        port: 22,
        key_check: KeyCheck::Strict,
        identity_files,
        known_hosts_files: vec![
            "/etc/ssh/ssh_known_hosts".to_string(),
            "/etc/ssh/ssh_known_hosts2".to_string(),
            "~/.ssh/known_hosts".to_string(),
            "~/.ssh/known_hosts2".to_string(),
        ],
        ciphers: Vec::new(),
        macs: Vec::new(),
        host_key_algos: Vec::new(),
        kex_algos: Vec::new(),
        jumps: Vec::new(),
    };
    Ok(vec![make_hop(hc).await?])
}

/// Attach signers and the host key policy, narrowing host key algorithms to
/// the intersection with known_hosts in strict mode.
async fn make_hop(hc: HostConfig) -> Result<Hop, Error> {
    let auth = keys::signers_for(&hc.alias, &hc.identity_files).await?;

    let (policy, host_key_algos) = match hc.key_check {
        KeyCheck::Off => (HostKeyPolicy::Permissive, hc.host_key_algos.clone()),
        KeyCheck::Strict => {
            let paths: Vec<PathBuf> = hc
                .known_hosts_files
                .iter()
                .map(|p| PathBuf::from(expand_tilde(p)))
                .filter(|p| {
                    let exists = p.exists();
                    if !exists {
                        debug!("could not open known hosts file {}", p.display());
                    }
                    exists
                })
                .collect();
            let store = Arc::new(KnownHostsStore::load(&paths)?);

            let known = store.host_key_algorithms(&hc.hostname, hc.port);
            let algos: Vec<String> = if hc.host_key_algos.is_empty() {
                known.clone()
            } else {
                hc.host_key_algos
                    .iter()
                    .filter(|a| known.contains(a))
                    .cloned()
                    .collect()
            };
            if algos.is_empty() {
                return Err(Error::HostKey(format!(
                    "{}: no suitable host key algorithms found: configured are {:?}, \
                     available in known_hosts are {:?}. Note that boring does not \
                     automatically add keys to your known_hosts.",
                    hc.alias, hc.host_key_algos, known
                )));
            }
            debug!(
                "{}: key types in known_hosts: {:?}, configured: {:?}, trying: {:?}",
                hc.alias, known, hc.host_key_algos, algos
            );
            (HostKeyPolicy::Strict(store), algos)
        }
    };

    Ok(Hop {
        alias: hc.alias,
        hostname: hc.hostname,
        port: hc.port,
        user: hc.user,
        auth,
        ciphers: hc.ciphers,
        macs: hc.macs,
        kex_algos: hc.kex_algos,
        host_key_algos,
        policy,
        timeout: SSH_CONNECT_TIMEOUT,
    })
}

/// Initial token bindings, before HostName/User/Port are known.
fn base_subst(alias: &str) -> Subst {
    let mut sub = Subst::new();
    sub.bind("%n", alias);
    sub.bind("%h", alias);
    sub.bind("%k", alias);
    if let Some(home) = dirs::home_dir() {
        sub.bind("%d", home.to_string_lossy());
    }
    sub.bind("%u", local_user());
    sub.bind("%i", nix::unistd::getuid().as_raw().to_string());
    if let Ok(hostname) = nix::unistd::gethostname() {
        let full = hostname.to_string_lossy().into_owned();
        let short = full.split('.').next().unwrap_or(&full).to_string();
        sub.bind("%l", full);
        sub.bind("%L", short);
    }
    sub
}

fn local_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| {
        nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_default()
    })
}

fn split_commas(s: &str) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    s.split(',').map(|p| p.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(content: &str) -> Resolver {
        Resolver::new(SshConfig::parse(content))
    }

    /// Expand an alias to the chain of per-alias configs, like resolve()
    /// does before signers are attached.
    fn chain(r: &Resolver, alias: &str) -> Result<Vec<HostConfig>, Error> {
        let mut out = Vec::new();
        r.chain_configs(r.parse_alias(alias)?, false, 0, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_jump_spec_parse() {
        assert_eq!(
            JumpSpec::parse("admin@jump.example.com:2222").unwrap(),
            JumpSpec {
                user: Some("admin".to_string()),
                host: "jump.example.com".to_string(),
                port: Some(2222),
            }
        );
        assert_eq!(
            JumpSpec::parse("bastion").unwrap(),
            JumpSpec {
                user: None,
                host: "bastion".to_string(),
                port: None,
            }
        );
        assert!(JumpSpec::parse("user@:22").is_err());
        assert!(JumpSpec::parse("host:notaport").is_err());
    }

    #[test]
    fn test_unknown_alias_gets_defaults() {
        let r = resolver("");
        let hc = r.parse_alias("plain.example.com").unwrap();
        assert_eq!(hc.hostname, "plain.example.com");
        assert_eq!(hc.port, 22);
        assert_eq!(hc.key_check, KeyCheck::Strict);
        assert!(hc.jumps.is_empty());
        assert!(!hc.host_key_algos.is_empty());
    }

    #[test]
    fn test_unsupported_strict_option_fails() {
        let r = resolver("Host bad\n    StrictHostKeyChecking sometimes\n");
        assert!(r.parse_alias("bad").is_err());
    }

    #[test]
    fn test_accept_new_downgrades_to_strict() {
        let r = resolver("Host h\n    StrictHostKeyChecking accept-new\n");
        assert_eq!(r.parse_alias("h").unwrap().key_check, KeyCheck::Strict);
    }

    #[test]
    fn test_jump_expansion_order() {
        let r = resolver(
            "Host inner\n    HostName inner.net\n    User a\n    ProxyJump bastion\n\
             Host bastion\n    HostName bastion.net\n    User b\n",
        );
        let chain = chain(&r, "inner").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].hostname, "bastion.net");
        assert_eq!(chain[1].hostname, "inner.net");
    }

    #[test]
    fn test_only_first_jump_contributes_jumps() {
        // inner jumps through j1,j2; j1 and j2 each declare their own jump.
        // j1's jump (deep) is honored, j2's must be suppressed.
        let r = resolver(
            "Host inner\n    ProxyJump j1,j2\n\
             Host j1\n    ProxyJump deep\n\
             Host j2\n    ProxyJump ignored\n\
             Host deep\nHost ignored\n\
             Host *\n    User tester\n",
        );
        let chain = chain(&r, "inner").unwrap();
        let names: Vec<&str> = chain.iter().map(|c| c.alias.as_str()).collect();
        assert_eq!(names, vec!["deep", "j1", "j2", "inner"]);
    }

    #[test]
    fn test_inline_user_port_override() {
        let r = resolver(
            "Host t\n    ProxyJump admin@jump:2200\n\
             Host jump\n    HostName jump.net\n    User other\n    Port 22\n\
             Host *\n    User tester\n",
        );
        let chain = chain(&r, "t").unwrap();
        assert_eq!(chain[0].user, "admin");
        assert_eq!(chain[0].port, 2200);
        assert_eq!(chain[0].hostname, "jump.net");
    }

    #[test]
    fn test_recursion_depth_limit() {
        // h0 -> h1 -> ... -> each alias jumps to the next.
        let mut cfg = String::new();
        for i in 0..25 {
            cfg.push_str(&format!("Host h{}\n    ProxyJump h{}\n", i, i + 1));
        }
        cfg.push_str("Host h25\nHost *\n    User tester\n");
        let r = resolver(&cfg);
        assert!(chain(&r, "h0").is_err());

        // A chain of exactly 20 recursions still resolves.
        let mut cfg = String::new();
        for i in 0..19 {
            cfg.push_str(&format!("Host g{}\n    ProxyJump g{}\n", i, i + 1));
        }
        cfg.push_str("Host g19\nHost *\n    User tester\n");
        let r = resolver(&cfg);
        let chain = chain(&r, "g0").unwrap();
        assert_eq!(chain.len(), 20);
    }

    #[test]
    fn test_proxy_token_substitution() {
        let r = resolver(
            "Host t\n    HostName t.example.com\n    User root\n    Port 2022\n    ProxyJump %r@gw-%h:22\n",
        );
        let hc = r.parse_alias("t").unwrap();
        assert_eq!(hc.jumps.len(), 1);
        assert_eq!(hc.jumps[0].user.as_deref(), Some("root"));
        assert_eq!(hc.jumps[0].host, "gw-t.example.com");
    }

    #[test]
    fn test_identity_file_tokens() {
        let r = resolver("Host t\n    HostName real.net\n    IdentityFile /keys/%h/%n\n");
        let hc = r.parse_alias("t").unwrap();
        assert_eq!(hc.identity_files, vec!["/keys/real.net/t"]);
    }

    #[test]
    fn test_known_hosts_files_are_split() {
        let r = resolver("");
        let hc = r.parse_alias("x").unwrap();
        assert_eq!(
            hc.known_hosts_files,
            vec![
                "/etc/ssh/ssh_known_hosts",
                "/etc/ssh/ssh_known_hosts2",
                "~/.ssh/known_hosts",
                "~/.ssh/known_hosts2",
            ]
        );
    }

    #[test]
    fn test_proxy_jump_none() {
        let r = resolver("Host t\n    ProxyJump none\n");
        assert!(r.parse_alias("t").unwrap().jumps.is_empty());
    }

    #[tokio::test]
    async fn test_strict_mode_algorithm_intersection() {
        use rand::rngs::OsRng;
        use russh::keys::ssh_key::{Algorithm, LineEnding};

        let dir = tempfile::tempdir().unwrap();
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let key_path = dir.path().join("id_test");
        std::fs::write(&key_path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

        // known_hosts only holds an ed25519 key for the host.
        let kh_path = dir.path().join("known_hosts");
        std::fs::write(
            &kh_path,
            "target.example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeFakeFake\n",
        )
        .unwrap();

        let cfg = format!(
            "Host target\n    HostName target.example.com\n    User u\n    \
             IdentityFile {}\n    UserKnownHostsFile {}\n    \
             GlobalKnownHostsFile /nonexistent\n    \
             HostKeyAlgorithms rsa-sha2-512,ssh-ed25519\n",
            key_path.display(),
            kh_path.display()
        );
        let hops = resolver(&cfg).resolve("target").await.unwrap();
        assert_eq!(hops.len(), 1);
        // Narrowed to the intersection, configured order preserved.
        assert_eq!(hops[0].host_key_algos, vec!["ssh-ed25519"]);

        // No overlap between configured and stored algorithms: resolution
        // fails and the message names both sets.
        let cfg = cfg.replace("rsa-sha2-512,ssh-ed25519", "rsa-sha2-512");
        let err = resolver(&cfg).resolve("target").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("no suitable host key algorithms"));
        assert!(msg.contains("rsa-sha2-512"));
        assert!(msg.contains("ssh-ed25519"));
    }
}
