//! Private key loading and signer selection for a hop.

use std::sync::Arc;

use russh::keys::{load_secret_key, PrivateKey, PublicKey};
use tracing::{debug, warn};

use super::agent;
use crate::error::Error;
use crate::paths::expand_tilde;

/// Conventional key paths tried when no identity yields a signer.
const DEFAULT_KEYS: &[&str] = &["~/.ssh/id_rsa", "~/.ssh/id_ecdsa", "~/.ssh/id_ed25519"];

/// One way to answer a publickey challenge.
#[derive(Clone)]
pub enum AuthSource {
    /// A private key loaded from disk.
    Key(Arc<PrivateKey>),
    /// A key held by the ssh-agent; the agent signs on request.
    Agent(PublicKey),
}

impl std::fmt::Debug for AuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthSource::Key(k) => write!(f, "Key({})", k.algorithm()),
            AuthSource::Agent(k) => write!(f, "Agent({})", k.algorithm()),
        }
    }
}

/// Produce the ordered auth list for a hop.
///
/// Explicit identity files are tried first; a file that cannot be read or
/// parsed is warned about and skipped. Only when none of them yields a signer
/// are the conventional default paths tried (silently), with agent keys
/// appended. An empty final list fails the hop.
pub async fn signers_for(alias: &str, identity_files: &[String]) -> Result<Vec<AuthSource>, Error> {
    let mut auth = load_key_files(identity_files, false);
    debug!("trying {} key file(s) for {}", auth.len(), alias);
    if !auth.is_empty() {
        return Ok(auth);
    }

    if !identity_files.is_empty() {
        warn!("no usable identity files for {alias}, trying default ones");
    }
    let defaults: Vec<String> = DEFAULT_KEYS.iter().map(|s| s.to_string()).collect();
    auth = load_key_files(&defaults, true);

    match agent::signers().await {
        Ok(keys) => {
            debug!("added {} signer(s) from ssh-agent", keys.len());
            auth.extend(keys.into_iter().map(AuthSource::Agent));
        }
        Err(e) => warn!("unable to get keys from ssh-agent: {e}"),
    }

    if auth.is_empty() {
        return Err(Error::Auth(format!("{alias}: no key files found")));
    }
    Ok(auth)
}

/// Load each key file that parses; `quiet` suppresses warnings for the
/// default paths, which are usually absent.
fn load_key_files(paths: &[String], quiet: bool) -> Vec<AuthSource> {
    let mut out = Vec::new();
    for path in paths {
        let expanded = expand_tilde(path);
        match load_secret_key(&expanded, None) {
            Ok(key) => out.push(AuthSource::Key(Arc::new(key))),
            Err(e) if quiet => debug!("skipping key file {path:?}: {e}"),
            Err(e) => warn!("key file {path:?} could not be added: {e}"),
        }
    }
    out
}
