//! Control-plane wire protocol.
//!
//! One JSON object per request and per response, each prefixed by its length
//! as a big-endian u32. A frame that does not decode closes the connection;
//! the daemon stays up.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;
use crate::tunnel::TunnelDesc;

/// Upper bound on a frame body; anything larger is a protocol error.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdKind {
    Nop,
    Open,
    Close,
    List,
}

/// A client request. `tunnel` carries the full description for Open and just
/// the name for Close.
#[derive(Debug, Serialize, Deserialize)]
pub struct Cmd {
    pub kind: CmdKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelDesc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Resp {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub tunnels: HashMap<String, TunnelDesc>,
}

impl Resp {
    pub fn ok() -> Resp {
        Resp {
            success: true,
            ..Default::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Resp {
        Resp {
            success: false,
            error: message.into(),
            ..Default::default()
        }
    }

    pub fn with_tunnels(tunnels: HashMap<String, TunnelDesc>) -> Resp {
        Resp {
            success: true,
            tunnels,
            ..Default::default()
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg).map_err(|e| Error::Protocol(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| Error::Protocol(format!("malformed frame: {e}")))
}
