//! Host key verification against known_hosts files.
//!
//! A store is built per hop from the union of the configured global and user
//! known_hosts files and is read-only: this tool never records new keys. The
//! store also reports which key algorithms it holds for a host, which the
//! resolver intersects with the configured HostKeyAlgorithms before dialing.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Error;

/// Result of verifying a server key against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a stored entry.
    Verified,
    /// No entry for this host (or none of this key type).
    Unknown { fingerprint: String },
    /// An entry of the same type exists but the key differs.
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// In-memory union of one or more known_hosts files.
#[derive(Debug, Default)]
pub struct KnownHostsStore {
    /// host (normalized, possibly `[host]:port`) -> stored keys
    hosts: HashMap<String, Vec<HostKeyEntry>>,
}

impl KnownHostsStore {
    /// Load and merge the given files. Unreadable files are skipped with a
    /// debug message; the caller filters non-existent paths beforehand.
    pub fn load(paths: &[PathBuf]) -> Result<Self, Error> {
        let mut store = Self::default();
        for path in paths {
            if let Err(e) = store.load_file(path) {
                debug!("could not read known_hosts file {}: {}", path.display(), e);
            }
        }
        Ok(store)
    }

    fn load_file(&mut self, path: &Path) -> std::io::Result<()> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Marker lines (@cert-authority, @revoked) are out of scope.
            if line.starts_with('@') {
                debug!("skipping marker entry in {}", path.display());
                continue;
            }

            // hostname[,hostname...] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }
            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames (|1|...) cannot be enumerated for the
                // algorithm intersection; skip them.
                if hostname.starts_with('|') {
                    continue;
                }
                self.hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
            }
        }
        Ok(())
    }

    /// Lookup key used when writing/reading entries: bare host for port 22,
    /// `[host]:port` otherwise.
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn entries(&self, host: &str, port: u16) -> Option<&Vec<HostKeyEntry>> {
        self.hosts
            .get(&Self::make_key(host, port))
            .or_else(|| self.hosts.get(&host.to_lowercase()))
    }

    /// SHA256 fingerprint in the OpenSSH presentation format.
    pub fn fingerprint(key: &PublicKey) -> String {
        Self::fingerprint_bytes(&key.public_key_bytes())
    }

    fn fingerprint_bytes(key_bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key_bytes);
        let hash = hasher.finalize();
        format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
    }

    /// Verify a server key for `host:port`.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let actual_b64 = BASE64.encode(key.public_key_bytes());
        let actual_type = key.algorithm().as_str().to_string();
        let fingerprint = Self::fingerprint(key);

        let Some(entries) = self.entries(host, port) else {
            debug!("unknown host: {}", Self::make_key(host, port));
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries {
            if entry.key_type != actual_type {
                continue;
            }
            if entry.key_data == actual_b64 {
                debug!("host key verified for {}:{} ({})", host, port, actual_type);
                return HostKeyVerification::Verified;
            }
            let expected = match BASE64.decode(&entry.key_data) {
                Ok(bytes) => Self::fingerprint_bytes(&bytes),
                Err(_) => "unknown".to_string(),
            };
            warn!(
                "host key changed for {}:{} ({})! expected {}, got {}",
                host, port, actual_type, expected, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint: expected,
                actual_fingerprint: fingerprint,
            };
        }

        // Host known, but not for this key type.
        debug!(
            "host {}:{} known, but no {} key stored",
            host, port, actual_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Host key algorithms the store can verify for `host:port`, in entry
    /// order. An `ssh-rsa` entry verifies all RSA signature algorithms, so it
    /// advertises the SHA-2 variants as well.
    pub fn host_key_algorithms(&self, host: &str, port: u16) -> Vec<String> {
        let mut algos: Vec<String> = Vec::new();
        let Some(entries) = self.entries(host, port) else {
            return algos;
        };
        for entry in entries {
            let expanded: Vec<&str> = match entry.key_type.as_str() {
                "ssh-rsa" => vec!["rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"],
                other => vec![other],
            };
            for a in expanded {
                if !algos.iter().any(|x| x == a) {
                    algos.push(a.to_string());
                }
            }
        }
        algos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_known_hosts(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("github.com", 22), "github.com");
        assert_eq!(
            KnownHostsStore::make_key("Server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_algorithms_with_rsa_expansion() {
        let (_dir, path) = write_known_hosts(
            "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeFakeFake\n\
             example.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABfake\n\
             [other.com]:2222 ecdsa-sha2-nistp256 AAAAE2VjZHNhfake\n",
        );
        let store = KnownHostsStore::load(&[path]).unwrap();

        assert_eq!(
            store.host_key_algorithms("example.com", 22),
            vec!["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256", "ssh-rsa"]
        );
        assert_eq!(
            store.host_key_algorithms("other.com", 2222),
            vec!["ecdsa-sha2-nistp256"]
        );
        assert!(store.host_key_algorithms("missing.com", 22).is_empty());
    }

    #[test]
    fn test_verify_roundtrip() {
        use rand::rngs::OsRng;
        use russh::keys::ssh_key::Algorithm;

        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let public = key.public_key();
        let b64 = public.public_key_base64();

        let (_dir, path) =
            write_known_hosts(&format!("myhost ssh-ed25519 {b64} comment@host\n"));
        let store = KnownHostsStore::load(&[path]).unwrap();

        assert_eq!(
            store.verify("myhost", 22, public),
            HostKeyVerification::Verified
        );
        // Same host and type, different key: Changed.
        let other = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        assert!(matches!(
            store.verify("myhost", 22, other.public_key()),
            HostKeyVerification::Changed { .. }
        ));
        assert!(matches!(
            store.verify("elsewhere", 22, public),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let store =
            KnownHostsStore::load(&[PathBuf::from("/nonexistent/known_hosts")]).unwrap();
        assert!(store.host_key_algorithms("any", 22).is_empty());
    }
}
