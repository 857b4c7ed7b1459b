//! Tunnel configuration file (`~/.boring.toml`).
//!
//! The client reads the file on every invocation and ships full descriptions
//! to the daemon; the daemon itself never touches it.

use std::fs;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;
use crate::tunnel::TunnelDesc;

const CONFIG_NAME: &str = ".boring.toml";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tunnels: Vec<TunnelDesc>,
}

/// Configuration file location: `BORING_CONFIG` or `~/.boring.toml`.
pub fn path() -> Result<PathBuf, Error> {
    if let Some(p) = std::env::var_os("BORING_CONFIG") {
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(CONFIG_NAME))
        .ok_or_else(|| Error::Config("could not determine home directory".to_string()))
}

/// Load all tunnel descriptions from the configuration file.
pub fn load() -> Result<Vec<TunnelDesc>, Error> {
    let path = path()?;
    let content = fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!(
            "could not read {}: {e}. Declare your tunnels there to get started.",
            path.display()
        ))
    })?;
    parse(&content).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

fn parse(content: &str) -> Result<Vec<TunnelDesc>, Error> {
    let parsed: ConfigFile =
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

    let mut seen = std::collections::HashSet::new();
    for tunnel in &parsed.tunnels {
        if tunnel.name.is_empty() {
            return Err(Error::Config("tunnel with empty name".to_string()));
        }
        if !seen.insert(tunnel.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate tunnel name '{}'",
                tunnel.name
            )));
        }
    }
    Ok(parsed.tunnels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelMode;

    #[test]
    fn test_parse_full_config() {
        let tunnels = parse(
            r#"
[[tunnels]]
name = "dev"
local = "9000"
remote = "localhost:9000"
host = "dev-server"

[[tunnels]]
name = "proxy"
mode = "socks"
local = "1080"
host = "prod.example.com"
user = "root"
identity = "~/.ssh/id_prod"
"#,
        )
        .unwrap();

        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].mode, TunnelMode::Local);
        assert_eq!(tunnels[0].local.as_deref(), Some("9000"));
        assert_eq!(tunnels[1].mode, TunnelMode::Socks);
        assert_eq!(tunnels[1].user.as_deref(), Some("root"));
        assert_eq!(tunnels[1].identity.as_deref(), Some("~/.ssh/id_prod"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = parse(
            "[[tunnels]]\nname = \"x\"\nhost = \"a\"\n\
             [[tunnels]]\nname = \"x\"\nhost = \"b\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate tunnel name"));
    }

    #[test]
    fn test_empty_file_has_no_tunnels() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(parse("[[tunnels]]\nname = \"x\"\nhost = \"a\"\nmode = \"udp\"\n").is_err());
    }
}
