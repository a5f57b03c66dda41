//! Byte piping between two duplex endpoints

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Copy bytes both ways until either side finishes, then shut both down.
///
/// Streams close as a whole, so the first EOF or error ends the bridge.
/// Returns the bytes moved `(a -> b, b -> a)` up to that point.
pub async fn bridge<A, B>(a: A, b: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = {
        let a_to_b = tokio::io::copy(&mut a_read, &mut b_write);
        let b_to_a = tokio::io::copy(&mut b_read, &mut a_write);
        tokio::select! {
            n = a_to_b => n.map(|n| (n, 0)),
            n = b_to_a => n.map(|n| (0, n)),
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    trace!("Bridge finished: {:?}", result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bridge_copies_and_closes() {
        let (client, bridge_a) = tokio::io::duplex(64);
        let (bridge_b, mut service) = tokio::io::duplex(64);
        let task = tokio::spawn(bridge(bridge_a, bridge_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        service.write_all(b"pong").await.unwrap();
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Service hangs up, the client sees EOF
        drop(service);
        let mut rest = Vec::new();
        client_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        task.await.unwrap().unwrap();
    }
}
