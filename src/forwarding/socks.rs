//! SOCKS5 negotiation (RFC 1928), CONNECT only.
//!
//! Generic over the transport: the forward SOCKS mode negotiates over a
//! local TCP socket, the reverse mode over an SSH channel stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Run the greeting and request phases, returning the requested target.
/// Failure replies for unsupported commands/address types are sent before
/// the error returns; the success reply is the caller's job, once its dial
/// outcome is known.
pub async fn handshake<S>(stream: &mut S) -> Result<(String, u16), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 260];

    // Greeting: VER NMETHODS METHODS...
    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| Error::Protocol(format!("failed to read SOCKS5 greeting: {e}")))?;
    let version = buf[0];
    let nmethods = buf[1] as usize;
    if version != VERSION {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {version}"
        )));
    }

    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| Error::Protocol(format!("failed to read auth methods: {e}")))?;
    if !buf[..nmethods].contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, 0xFF]).await.ok();
        return Err(Error::Protocol(
            "client does not support the NO AUTH method".to_string(),
        ));
    }
    stream
        .write_all(&[VERSION, AUTH_NONE])
        .await
        .map_err(|e| Error::Protocol(format!("failed to send auth response: {e}")))?;

    // Request: VER CMD RSV ATYP ADDR PORT
    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| Error::Protocol(format!("failed to read SOCKS5 request: {e}")))?;
    if buf[0] != VERSION {
        return Err(Error::Protocol(
            "invalid SOCKS5 version in request".to_string(),
        ));
    }
    let cmd = buf[1];
    let atyp = buf[3];
    if cmd != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!(
            "unsupported SOCKS5 command: {cmd}"
        )));
    }

    let (host, port) = match atyp {
        ATYP_IPV4 => {
            stream
                .read_exact(&mut buf[..6])
                .await
                .map_err(|e| Error::Protocol(format!("failed to read IPv4 address: {e}")))?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip.to_string(), port)
        }
        ATYP_DOMAIN => {
            stream
                .read_exact(&mut buf[..1])
                .await
                .map_err(|e| Error::Protocol(format!("failed to read domain length: {e}")))?;
            let len = buf[0] as usize;
            stream
                .read_exact(&mut buf[..len + 2])
                .await
                .map_err(|e| Error::Protocol(format!("failed to read domain: {e}")))?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            (domain, port)
        }
        ATYP_IPV6 => {
            stream
                .read_exact(&mut buf[..18])
                .await
                .map_err(|e| Error::Protocol(format!("failed to read IPv6 address: {e}")))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (ip.to_string(), port)
        }
        _ => {
            reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "unsupported address type: {atyp}"
            )));
        }
    };

    Ok((host, port))
}

/// Send a reply with the given status and a zeroed bound address.
pub async fn reply<S>(stream: &mut S, status: u8) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        VERSION, status, 0x00, ATYP_IPV4, 0, 0, 0, 0, // 0.0.0.0
        0, 0, // port 0
    ];
    stream
        .write_all(&reply)
        .await
        .map_err(|e| Error::Protocol(format!("failed to send SOCKS5 reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn run_handshake(request: Vec<u8>) -> (Result<(String, u16), Error>, Vec<u8>) {
        let (mut client, mut server) = duplex(512);
        let client_task = tokio::spawn(async move {
            client.write_all(&request).await.unwrap();
            let mut responses = Vec::new();
            client.read_to_end(&mut responses).await.ok();
            responses
        });
        let result = handshake(&mut server).await;
        drop(server);
        let responses = client_task.await.unwrap();
        (result, responses)
    }

    #[tokio::test]
    async fn test_domain_request() {
        let mut req = vec![VERSION, 1, AUTH_NONE]; // greeting
        req.extend([VERSION, CMD_CONNECT, 0, ATYP_DOMAIN]);
        req.push(11); // "example.org"
        req.extend(b"example.org");
        req.extend(443u16.to_be_bytes());

        let (result, responses) = run_handshake(req).await;
        let (host, port) = result.unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 443);
        // Auth response only; the success reply is the caller's.
        assert_eq!(responses, vec![VERSION, AUTH_NONE]);
    }

    #[tokio::test]
    async fn test_ipv4_request() {
        let mut req = vec![VERSION, 1, AUTH_NONE];
        req.extend([VERSION, CMD_CONNECT, 0, ATYP_IPV4, 127, 0, 0, 1]);
        req.extend(8080u16.to_be_bytes());

        let (result, _) = run_handshake(req).await;
        assert_eq!(result.unwrap(), ("127.0.0.1".to_string(), 8080));
    }

    #[tokio::test]
    async fn test_ipv6_request() {
        let mut req = vec![VERSION, 1, AUTH_NONE];
        req.extend([VERSION, CMD_CONNECT, 0, ATYP_IPV6]);
        req.extend(std::net::Ipv6Addr::LOCALHOST.octets());
        req.extend(9000u16.to_be_bytes());

        let (result, _) = run_handshake(req).await;
        assert_eq!(result.unwrap(), ("::1".to_string(), 9000));
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let mut req = vec![VERSION, 1, AUTH_NONE];
        req.extend([VERSION, 0x02 /* BIND */, 0, ATYP_IPV4, 0, 0, 0, 0]);
        req.extend(0u16.to_be_bytes());

        let (result, responses) = run_handshake(req).await;
        assert!(result.is_err());
        // Auth ok, then a CMD_NOT_SUPPORTED reply.
        assert_eq!(responses[..2], [VERSION, AUTH_NONE]);
        assert_eq!(responses[2..4], [VERSION, REP_CMD_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_rejects_clients_without_noauth() {
        let req = vec![VERSION, 1, 0x02 /* username/password only */];
        let (result, responses) = run_handshake(req).await;
        assert!(result.is_err());
        assert_eq!(responses, vec![VERSION, 0xFF]);
    }
}
