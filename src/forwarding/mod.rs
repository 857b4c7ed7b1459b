//! Forwarding engine: endpoint grammar, listeners and the per-mode
//! connection strategies sharing one paired-copy primitive.

pub mod local;
pub mod pump;
pub mod remote;
pub mod socks;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::warn;

use crate::error::Error;

/// Object-safe byte stream, so TCP sockets, Unix sockets and SSH channel
/// streams can flow through the same pump.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

/// A forward endpoint: TCP `host:port` or a Unix socket path.
///
/// Distinguished syntactically: a `/` anywhere or a leading `.` means a
/// filesystem path; a bare port expands to `localhost:port`; IPv6 addresses
/// take the `[addr]:port` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Endpoint, Error> {
        if s.is_empty() {
            return Err(Error::Config("empty endpoint".to_string()));
        }
        if s.contains('/') || s.starts_with('.') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        if let Ok(port) = s.parse::<u16>() {
            if port == 0 {
                return Err(Error::Config(format!("invalid port in endpoint '{s}'")));
            }
            return Ok(Endpoint::Tcp {
                host: "localhost".to_string(),
                port,
            });
        }
        if let Some(rest) = s.strip_prefix('[') {
            let Some((host, port)) = rest.split_once("]:") else {
                return Err(Error::Config(format!("invalid endpoint '{s}'")));
            };
            let port = parse_port(port, s)?;
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = parse_port(port, s)?;
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(Error::Config(format!("invalid endpoint '{s}'"))),
        }
    }

    /// TCP host and port, if this is a TCP endpoint.
    pub fn tcp(&self) -> Option<(&str, u16)> {
        match self {
            Endpoint::Tcp { host, port } => Some((host, *port)),
            Endpoint::Unix(_) => None,
        }
    }

    /// Dial the endpoint from this process.
    pub async fn connect(&self) -> std::io::Result<BoxStream> {
        match self {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY: {e}");
                }
                Ok(Box::new(stream))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "[{host}]:{port}")
            }
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn parse_port(p: &str, whole: &str) -> Result<u16, Error> {
    match p.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::Config(format!("invalid port in endpoint '{whole}'"))),
    }
}

/// A bound local listener. The Unix variant removes its socket file when the
/// listener is dropped on tunnel close.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Listener, Error> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|e| bind_error(endpoint, e))?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Unix(path) => {
                let listener =
                    UnixListener::bind(path).map_err(|e| bind_error(endpoint, e))?;
                Ok(Listener::Unix(listener, path.clone()))
            }
        }
    }

    pub async fn accept(&self) -> std::io::Result<BoxStream> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY: {e}");
                }
                Ok(Box::new(stream))
            }
            Listener::Unix(l, _) => {
                let (stream, _) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    pub fn local_desc(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<tcp>".to_string()),
            Listener::Unix(_, path) => path.display().to_string(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_error(endpoint: &Endpoint, e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => Error::Network(format!(
            "address already in use: {endpoint}. Another application may be using it."
        )),
        std::io::ErrorKind::PermissionDenied => Error::Network(format!(
            "permission denied binding to {endpoint}. Ports below 1024 require elevated privileges."
        )),
        _ => Error::Network(format!("failed to bind to {endpoint}: {e}")),
    }
}

/// Connection counters shared between a tunnel's supervisor and its
/// connection tasks. Updated lock-free from async handlers.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
}

impl ConnStats {
    pub fn enter(&self) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.active_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Wait until every in-flight connection has released its sockets, bounded
/// by `timeout`.
pub async fn wait_for_drain(stats: &ConnStats, timeout: Duration) {
    let start = std::time::Instant::now();
    while stats.active() > 0 {
        if start.elapsed() > timeout {
            warn!(
                "timeout waiting for {} active connection(s) to close",
                stats.active()
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port() {
        assert_eq!(
            Endpoint::parse("9000").unwrap(),
            Endpoint::Tcp {
                host: "localhost".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn test_host_port() {
        assert_eq!(
            Endpoint::parse("db.internal:5432").unwrap(),
            Endpoint::Tcp {
                host: "db.internal".to_string(),
                port: 5432
            }
        );
    }

    #[test]
    fn test_ipv6() {
        let ep = Endpoint::parse("[::1]:9000").unwrap();
        assert_eq!(
            ep,
            Endpoint::Tcp {
                host: "::1".to_string(),
                port: 9000
            }
        );
        assert_eq!(ep.to_string(), "[::1]:9000");
    }

    #[test]
    fn test_unix_paths() {
        assert_eq!(
            Endpoint::parse("/tmp/x.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/x.sock"))
        );
        assert_eq!(
            Endpoint::parse("./relative.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("./relative.sock"))
        );
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("0").is_err());
        assert!(Endpoint::parse("host:").is_err());
        assert!(Endpoint::parse(":9000").is_err());
        assert!(Endpoint::parse("host:70000").is_err());
        assert!(Endpoint::parse("[::1]").is_err());
        assert!(Endpoint::parse("justahost").is_err());
    }

    #[tokio::test]
    async fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let ep = Endpoint::Unix(path.clone());
        let listener = Listener::bind(&ep).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
