use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Byte counts for a finished forwarding session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client toward the upstream.
    pub upstream_bytes: u64,
    /// Bytes copied from the upstream back toward the client.
    pub downstream_bytes: u64,
}

/// Relay bytes between `client` and `upstream` until both directions finish.
///
/// Each direction is copied independently. When one direction reaches
/// end-of-stream, the write half of the opposite socket is shut down so the
/// peer observes the close. If either direction fails, the function returns
/// the error immediately and both sockets are dropped.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> io::Result<RelayStats> {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let (upstream_bytes, downstream_bytes) = tokio::try_join!(
        copy_then_shutdown(client_read, upstream_write),
        copy_then_shutdown(upstream_read, client_write),
    )?;

    Ok(RelayStats {
        upstream_bytes,
        downstream_bytes,
    })
}

/// Copy one direction to completion, then half-close the writer.
async fn copy_then_shutdown<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Build a connected (client-side, server-side) socket pair.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn relays_both_directions_and_counts_bytes() {
        // browser <-> [client_side | relay | upstream_side] <-> agent
        let (mut browser, client_side) = socket_pair().await;
        let (upstream_side, mut agent) = socket_pair().await;

        let session = tokio::spawn(relay(client_side, upstream_side));

        browser.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        agent.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        browser.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(browser);
        // The agent sees EOF once the browser goes away.
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(agent);

        let stats = session.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                upstream_bytes: 4,
                downstream_bytes: 5
            }
        );
    }

    #[tokio::test]
    async fn upstream_close_is_seen_by_client() {
        let (mut browser, client_side) = socket_pair().await;
        let (upstream_side, agent) = socket_pair().await;

        let session = tokio::spawn(relay(client_side, upstream_side));

        drop(agent);

        let mut rest = Vec::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            browser.read_to_end(&mut rest),
        )
        .await
        .expect("client never observed the upstream close");
        assert!(read.is_ok());

        drop(browser);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), session)
            .await
            .expect("relay task did not finish");
    }
}
