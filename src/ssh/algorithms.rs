//! Mapping from ssh_config algorithm names to russh negotiation preferences.
//!
//! Configured lists are filtered down to what russh implements; names russh
//! has no implementation for are dropped with a debug message. An empty
//! result falls back to the russh defaults so a config written for a more
//! capable client still connects.

use std::borrow::Cow;

use russh::keys::Algorithm;
use russh::{cipher, kex, mac, Preferred};
use tracing::debug;

fn kex_name(name: &str) -> Option<kex::Name> {
    match name {
        "curve25519-sha256" => Some(kex::CURVE25519),
        "curve25519-sha256@libssh.org" => Some(kex::CURVE25519_PRE_RFC_8731),
        "ecdh-sha2-nistp256" => Some(kex::ECDH_SHA2_NISTP256),
        "ecdh-sha2-nistp384" => Some(kex::ECDH_SHA2_NISTP384),
        "ecdh-sha2-nistp521" => Some(kex::ECDH_SHA2_NISTP521),
        "diffie-hellman-group1-sha1" => Some(kex::DH_G1_SHA1),
        "diffie-hellman-group14-sha1" => Some(kex::DH_G14_SHA1),
        "diffie-hellman-group14-sha256" => Some(kex::DH_G14_SHA256),
        "diffie-hellman-group16-sha512" => Some(kex::DH_G16_SHA512),
        _ => None,
    }
}

fn cipher_name(name: &str) -> Option<cipher::Name> {
    match name {
        "chacha20-poly1305@openssh.com" => Some(cipher::CHACHA20_POLY1305),
        "aes256-gcm@openssh.com" => Some(cipher::AES_256_GCM),
        "aes256-ctr" => Some(cipher::AES_256_CTR),
        "aes192-ctr" => Some(cipher::AES_192_CTR),
        "aes128-ctr" => Some(cipher::AES_128_CTR),
        _ => None,
    }
}

fn mac_name(name: &str) -> Option<mac::Name> {
    match name {
        "hmac-sha2-256-etm@openssh.com" => Some(mac::HMAC_SHA256_ETM),
        "hmac-sha2-512-etm@openssh.com" => Some(mac::HMAC_SHA512_ETM),
        "hmac-sha1-etm@openssh.com" => Some(mac::HMAC_SHA1_ETM),
        "hmac-sha2-256" => Some(mac::HMAC_SHA256),
        "hmac-sha2-512" => Some(mac::HMAC_SHA512),
        "hmac-sha1" => Some(mac::HMAC_SHA1),
        _ => None,
    }
}

fn map_names<T>(kind: &str, names: &[String], f: impl Fn(&str) -> Option<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        match f(name) {
            Some(v) => out.push(v),
            None => debug!("{kind} algorithm '{name}' is not supported, skipping"),
        }
    }
    out
}

/// Build russh negotiation preferences from resolved config lists, keeping
/// the configured order. `host_key_algos` is already narrowed by the
/// known-hosts intersection in strict mode.
pub fn preferred(
    ciphers: &[String],
    macs: &[String],
    kex_algos: &[String],
    host_key_algos: &[String],
) -> Preferred {
    let mut kexes = map_names("kex", kex_algos, kex_name);
    if !kexes.is_empty() {
        // ext-info-c must stay advertised or servers will not announce
        // server-sig-algs, breaking rsa-sha2 public key auth.
        kexes.push(kex::EXTENSION_SUPPORT_AS_CLIENT);
    }
    let ciphers = map_names("cipher", ciphers, cipher_name);
    let macs = map_names("mac", macs, mac_name);
    let keys: Vec<Algorithm> = host_key_algos
        .iter()
        .filter_map(|name| match Algorithm::new(name) {
            Ok(a) => Some(a),
            Err(_) => {
                debug!("host key algorithm '{name}' is not supported, skipping");
                None
            }
        })
        .collect();

    Preferred {
        kex: if kexes.is_empty() {
            Preferred::DEFAULT.kex.clone()
        } else {
            Cow::Owned(kexes)
        },
        key: if keys.is_empty() {
            Preferred::DEFAULT.key.clone()
        } else {
            Cow::Owned(keys)
        },
        cipher: if ciphers.is_empty() {
            Preferred::DEFAULT.cipher.clone()
        } else {
            Cow::Owned(ciphers)
        },
        mac: if macs.is_empty() {
            Preferred::DEFAULT.mac.clone()
        } else {
            Cow::Owned(macs)
        },
        ..Preferred::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_configured_order_is_kept() {
        let p = preferred(
            &strings(&["aes256-ctr", "chacha20-poly1305@openssh.com"]),
            &[],
            &[],
            &[],
        );
        assert_eq!(
            p.cipher.as_ref(),
            &[cipher::AES_256_CTR, cipher::CHACHA20_POLY1305]
        );
    }

    #[test]
    fn test_unknown_names_are_dropped() {
        let p = preferred(
            &strings(&["rot13", "aes128-ctr"]),
            &strings(&["umac-64@openssh.com", "hmac-sha2-256"]),
            &[],
            &[],
        );
        assert_eq!(p.cipher.as_ref(), &[cipher::AES_128_CTR]);
        assert_eq!(p.mac.as_ref(), &[mac::HMAC_SHA256]);
    }

    #[test]
    fn test_empty_lists_fall_back_to_defaults() {
        let p = preferred(&[], &[], &[], &[]);
        assert_eq!(p.kex, Preferred::DEFAULT.kex);
        assert_eq!(p.cipher, Preferred::DEFAULT.cipher);
    }

    #[test]
    fn test_ext_info_appended_to_kex() {
        let p = preferred(&[], &[], &strings(&["curve25519-sha256"]), &[]);
        assert_eq!(
            p.kex.as_ref(),
            &[kex::CURVE25519, kex::EXTENSION_SUPPORT_AS_CLIENT]
        );
    }

    #[test]
    fn test_host_key_algorithms_parse() {
        let p = preferred(&[], &[], &[], &strings(&["ssh-ed25519", "rsa-sha2-512"]));
        assert_eq!(p.key.len(), 2);
    }
}
