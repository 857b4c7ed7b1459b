//! The pump: paired bidirectional byte copy between two streams.

use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes in both directions until both sides have finished.
///
/// Each direction runs as its own copy; when one observes EOF or an error it
/// half-closes the peer's write side and the pair completes only once the
/// other direction has unwound too. Returns (a→b, b→a) byte counts.
/// Per-connection errors are logged here and never propagate.
pub async fn pump<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = io::split(a);
    let (mut b_read, mut b_write) = io::split(b);

    let a_to_b = async {
        let copied = io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        copied
    };
    let b_to_a = async {
        let copied = io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        copied
    };

    let (ab, ba) = tokio::join!(a_to_b, b_to_a);

    let ab = match ab {
        Ok(n) => n,
        Err(e) => {
            debug!("copy error: {e}");
            0
        }
    };
    let ba = match ba {
        Ok(n) => n,
        Err(e) => {
            debug!("copy error: {e}");
            0
        }
    };
    (ab, ba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pump_copies_both_directions() {
        // client <-> (near_a | far_a) pump (near_b | far_b) <-> server
        let (mut client, near_a) = io::duplex(64);
        let (near_b, mut server) = io::duplex(64);

        let pump_task = tokio::spawn(pump(near_a, near_b));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing both outer ends lets the pump drain and finish.
        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        let (ab, ba) = pump_task.await.unwrap();
        assert_eq!(ab, 4);
        assert_eq!(ba, 4);
    }

    #[tokio::test]
    async fn test_pump_propagates_half_close() {
        let (mut client, near_a) = io::duplex(64);
        let (near_b, mut server) = io::duplex(64);
        let pump_task = tokio::spawn(pump(near_a, near_b));

        client.write_all(b"done").await.unwrap();
        client.shutdown().await.unwrap();

        // Server sees the data followed by EOF.
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"done");

        server.shutdown().await.unwrap();
        pump_task.await.unwrap();
    }
}
