//! Home-directory and `%`-token expansion for configuration values.
//!
//! Implements the subset of OpenSSH "TOKENS" (see ssh_config(5)) that applies
//! to HostName, ProxyJump, IdentityFile and UserKnownHostsFile values. `%%`
//! escapes a literal percent sign and is never re-scanned; tokens outside the
//! allowed set for a field are left verbatim.

use std::collections::HashMap;

/// Expand a leading `~` to the current user's home directory.
/// Paths like `~/.ssh/id_ed25519` must be normalized before they reach
/// russh::keys, which does not handle tildes.
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// A set of `%`-token bindings applied to configuration templates.
#[derive(Debug, Clone, Default)]
pub struct Subst {
    bindings: HashMap<String, String>,
}

impl Subst {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a token (e.g. `"%h"`) to its replacement value. Later binds
    /// overwrite earlier ones, which is how `%h` switches from the alias to
    /// the resolved hostname once HostName is known.
    pub fn bind(&mut self, token: &str, value: impl Into<String>) {
        self.bindings.insert(token.to_string(), value.into());
    }

    /// Replace every occurrence of an allowed, bound token in `template`.
    /// Scans left to right in a single pass; `%%` produces `%`, unknown or
    /// unbound `%X` sequences are kept verbatim.
    pub fn apply(&self, template: &str, allowed: &[&str]) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(idx) = rest.find('%') {
            out.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            let mut chars = tail.chars();
            chars.next(); // the '%'

            match chars.next() {
                Some('%') if allowed.contains(&"%%") => {
                    out.push('%');
                    rest = &tail[2..];
                }
                Some(c) => {
                    let token = format!("%{c}");
                    if allowed.contains(&token.as_str()) {
                        if let Some(value) = self.bindings.get(&token) {
                            out.push_str(value);
                            rest = &tail[1 + c.len_utf8()..];
                            continue;
                        }
                    }
                    out.push('%');
                    rest = &tail[1..];
                }
                None => {
                    out.push('%');
                    rest = "";
                }
            }
        }

        out.push_str(rest);
        out
    }

    /// Apply the substitution to each template in a list.
    pub fn apply_all(&self, templates: Vec<String>, allowed: &[&str]) -> Vec<String> {
        templates
            .into_iter()
            .map(|t| self.apply(&t, allowed))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subst() -> Subst {
        let mut s = Subst::new();
        s.bind("%h", "example.com");
        s.bind("%p", "2222");
        s
    }

    #[test]
    fn test_replaces_bound_tokens() {
        let s = subst();
        assert_eq!(
            s.apply("ssh://%h:%p/", &["%%", "%h", "%p"]),
            "ssh://example.com:2222/"
        );
    }

    #[test]
    fn test_percent_escape() {
        let s = subst();
        assert_eq!(s.apply("100%%", &["%%", "%h"]), "100%");
        // The escaped percent must not be re-scanned into a token.
        assert_eq!(s.apply("%%h", &["%%", "%h"]), "%h");
    }

    #[test]
    fn test_unknown_token_left_verbatim() {
        let s = subst();
        assert_eq!(s.apply("%q%h", &["%%", "%h"]), "%qexample.com");
        // Allowed but unbound tokens are also kept as-is.
        assert_eq!(s.apply("%r@%h", &["%%", "%r", "%h"]), "%r@example.com");
    }

    #[test]
    fn test_trailing_percent() {
        let s = subst();
        assert_eq!(s.apply("50%", &["%%", "%h"]), "50%");
    }

    #[test]
    fn test_idempotent_on_expanded_strings() {
        let s = subst();
        let once = s.apply("%h:%p and 100%%", &["%%", "%h", "%p"]);
        let twice = s.apply(&once, &["%%", "%h", "%p"]);
        // "example.com:2222 and 100%" contains no further tokens.
        assert_eq!(once, twice);
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(
            expand_tilde("~/.ssh/id_rsa"),
            home.join(".ssh/id_rsa").to_string_lossy()
        );
        assert_eq!(expand_tilde("~"), home.to_string_lossy());
        assert_eq!(expand_tilde("/etc/ssh/ssh_config"), "/etc/ssh/ssh_config");
    }
}
