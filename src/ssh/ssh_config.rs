//! Lookup over the user's SSH client configuration (`~/.ssh/config`).
//!
//! Parses the file into Host blocks and answers `get`/`get_all` queries for a
//! concrete alias, merging every matching block in file order: the first
//! obtained value wins for single-valued keys, multi-valued keys accumulate.
//! A small defaults table stands in for the values OpenSSH would assume, so
//! resolution of an alias that appears nowhere in the file still produces a
//! dialable host.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::error::Error;

/// Defaults applied when no matching block provides a value, mirroring the
/// client defaults of ssh_config(5). `HostName` defaults to `%h` so that an
/// unconfigured alias resolves to itself.
fn default_for(key: &str) -> Option<&'static str> {
    match key {
        "hostname" => Some("%h"),
        "port" => Some("22"),
        "stricthostkeychecking" => Some("ask"),
        "ciphers" => Some(
            "chacha20-poly1305@openssh.com,\
             aes128-ctr,aes192-ctr,aes256-ctr,\
             aes128-gcm@openssh.com,aes256-gcm@openssh.com",
        ),
        "macs" => Some(
            "hmac-sha2-256-etm@openssh.com,hmac-sha2-512-etm@openssh.com,\
             hmac-sha1-etm@openssh.com,hmac-sha2-256,hmac-sha2-512,hmac-sha1",
        ),
        "hostkeyalgorithms" => Some(
            "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,\
             ecdsa-sha2-nistp521,rsa-sha2-512,rsa-sha2-256,ssh-rsa",
        ),
        "kexalgorithms" => Some(
            "curve25519-sha256,curve25519-sha256@libssh.org,\
             ecdh-sha2-nistp256,ecdh-sha2-nistp384,ecdh-sha2-nistp521,\
             diffie-hellman-group14-sha256,diffie-hellman-group16-sha512",
        ),
        "globalknownhostsfile" => Some("/etc/ssh/ssh_known_hosts /etc/ssh/ssh_known_hosts2"),
        "userknownhostsfile" => Some("~/.ssh/known_hosts ~/.ssh/known_hosts2"),
        _ => None,
    }
}

/// One `Host` block: its patterns and the directives below it.
#[derive(Debug, Clone)]
struct Block {
    patterns: Vec<String>,
    /// (lowercased key, raw value) pairs in file order.
    entries: Vec<(String, String)>,
}

impl Block {
    fn matches(&self, alias: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, alias) {
                    return false;
                }
            } else if glob_match(pattern, alias) {
                matched = true;
            }
        }
        matched
    }
}

/// Parsed SSH client configuration.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

impl SshConfig {
    /// Read the configuration from `path`, or from `~/.ssh/config` when no
    /// path is given. A missing file yields an empty configuration.
    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        let path = match path {
            Some(p) => p,
            None => match dirs::home_dir() {
                Some(home) => home.join(".ssh").join("config"),
                None => {
                    return Err(Error::Config(
                        "could not determine home directory".to_string(),
                    ))
                }
            },
        };

        match fs::read_to_string(&path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no SSH config at {}", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Parse configuration content. Malformed lines are skipped.
    pub fn parse(content: &str) -> Self {
        let mut blocks: Vec<Block> = Vec::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // "Key Value" or "Key=Value"
            let (key, value) = if let Some(eq) = line.find('=') {
                (line[..eq].trim(), line[eq + 1..].trim())
            } else {
                match line.split_once(char::is_whitespace) {
                    Some((k, v)) => (k, v.trim()),
                    None => continue,
                }
            };
            let key = key.to_lowercase();

            if key == "host" {
                blocks.push(Block {
                    patterns: value.split_whitespace().map(str::to_string).collect(),
                    entries: Vec::new(),
                });
            } else if let Some(block) = blocks.last_mut() {
                block.entries.push((key, value.to_string()));
            }
            // Directives before the first Host block apply to nothing here;
            // OpenSSH treats them as global, which no recognized key needs.
        }

        Self { blocks }
    }

    /// First obtained value for `key`, searching matching blocks in file
    /// order, then the defaults table. Returns `""` when nothing applies.
    pub fn get(&self, alias: &str, key: &str) -> String {
        let key = key.to_lowercase();
        for block in self.blocks.iter().filter(|b| b.matches(alias)) {
            if let Some((_, v)) = block.entries.iter().find(|(k, _)| *k == key) {
                return v.clone();
            }
        }
        default_for(&key).unwrap_or_default().to_string()
    }

    /// All values for `key` across matching blocks, in file order. Falls back
    /// to the default as a single entry, except for IdentityFile whose
    /// absence is meaningful to the caller.
    pub fn get_all(&self, alias: &str, key: &str) -> Vec<String> {
        let key = key.to_lowercase();
        let mut values = Vec::new();
        for block in self.blocks.iter().filter(|b| b.matches(alias)) {
            for (_, v) in block.entries.iter().filter(|(k, _)| *k == key) {
                values.push(v.clone());
            }
        }
        if values.is_empty() && key != "identityfile" {
            if let Some(d) = default_for(&key) {
                values.push(d.to_string());
            }
        }
        values
    }
}

/// ssh_config-style pattern match: `*` matches any run of characters, `?`
/// matches exactly one.
fn glob_match(pattern: &str, s: &str) -> bool {
    fn inner(p: &[char], s: &[char]) -> bool {
        match (p.first(), s.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], s) || (!s.is_empty() && inner(p, &s[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &s[1..]),
            (Some(pc), Some(sc)) if pc == sc => inner(&p[1..], &s[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = s.chars().collect();
    inner(&p, &s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
# comment
Host dev
    HostName dev.example.com
    User deploy
    Port 2222
    IdentityFile ~/.ssh/id_dev
    IdentityFile ~/.ssh/id_backup

Host inner
    HostName inner.example.com
    ProxyJump bastion

Host dev inner
    User fallback
    StrictHostKeyChecking no

Host *.example.com bastion
    User jumper
"#;

    #[test]
    fn test_first_match_wins() {
        let cfg = SshConfig::parse(CONFIG);
        assert_eq!(cfg.get("dev", "HostName"), "dev.example.com");
        // "deploy" comes from an earlier block than "fallback".
        assert_eq!(cfg.get("dev", "User"), "deploy");
        assert_eq!(cfg.get("inner", "User"), "fallback");
        assert_eq!(cfg.get("dev", "Port"), "2222");
    }

    #[test]
    fn test_wildcard_patterns() {
        let cfg = SshConfig::parse(CONFIG);
        assert_eq!(cfg.get("bastion", "User"), "jumper");
        assert_eq!(cfg.get("web.example.com", "User"), "jumper");
        assert!(glob_match("dev-??", "dev-01"));
        assert!(!glob_match("dev-??", "dev-001"));
    }

    #[test]
    fn test_negated_pattern_excludes() {
        let cfg = SshConfig::parse("Host * !secret\n    User everyone\n");
        assert_eq!(cfg.get("anything", "User"), "everyone");
        assert_eq!(cfg.get("secret", "User"), "");
    }

    #[test]
    fn test_get_all_accumulates() {
        let cfg = SshConfig::parse(CONFIG);
        let ids = cfg.get_all("dev", "IdentityFile");
        assert_eq!(ids, vec!["~/.ssh/id_dev", "~/.ssh/id_backup"]);
        // No IdentityFile default: absence triggers the fallback key logic.
        assert!(cfg.get_all("bastion", "IdentityFile").is_empty());
    }

    #[test]
    fn test_defaults_for_unknown_alias() {
        let cfg = SshConfig::parse("");
        assert_eq!(cfg.get("nowhere", "Port"), "22");
        assert_eq!(cfg.get("nowhere", "HostName"), "%h");
        assert_eq!(cfg.get("nowhere", "StrictHostKeyChecking"), "ask");
        assert!(!cfg.get("nowhere", "HostKeyAlgorithms").is_empty());
        assert_eq!(
            cfg.get_all("nowhere", "UserKnownHostsFile"),
            vec!["~/.ssh/known_hosts ~/.ssh/known_hosts2"]
        );
    }

    #[test]
    fn test_key_equals_value_syntax() {
        let cfg = SshConfig::parse("Host x\n    HostName=x.example.com\n");
        assert_eq!(cfg.get("x", "HostName"), "x.example.com");
    }
}
