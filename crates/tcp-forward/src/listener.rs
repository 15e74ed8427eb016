use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::relay::relay;

/// Pause after a failed `accept` so a persistent failure (for example
/// descriptor exhaustion) does not turn the accept loop into a busy loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Configuration for the TCP forwarder.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Address to bind the public listening socket to.
    pub listen_addr: SocketAddr,
    /// Upstream `host:port` every accepted connection is relayed to.
    pub upstream_addr: String,
}

/// The TCP forwarder.
///
/// Accepts client connections indefinitely and pairs each one with a new
/// connection to the fixed upstream address.
pub struct Forwarder {
    config: Arc<ForwardConfig>,
}

/// A forwarder whose listening socket is already bound.
pub struct BoundForwarder {
    listener: TcpListener,
    config: Arc<ForwardConfig>,
}

impl Forwarder {
    /// Create a new forwarder with the given configuration.
    pub fn new(config: ForwardConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind the listening socket without starting the accept loop.
    ///
    /// A bind failure is a startup misconfiguration and is returned to the
    /// caller rather than retried.
    pub async fn bind(&self) -> io::Result<BoundForwarder> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        Ok(BoundForwarder {
            listener,
            config: Arc::clone(&self.config),
        })
    }

    /// Bind and run the forwarder. Only returns if binding fails.
    pub async fn run(&self) -> io::Result<()> {
        self.bind().await?.run().await;
        Ok(())
    }
}

impl BoundForwarder {
    /// The address the listener is actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Each connection is handled in its own
    /// Tokio task; accept failures are logged and never end the loop.
    pub async fn run(self) {
        tracing::info!(
            addr = %self.config.listen_addr,
            upstream = %self.config.upstream_addr,
            "tcp-forward listening"
        );

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed; continuing");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    continue;
                }
            };

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                handle_connection(stream, remote_addr, config).await;
            });
        }
    }
}

/// Handle a single client connection from upstream connect through teardown.
async fn handle_connection(client: TcpStream, remote_addr: SocketAddr, config: Arc<ForwardConfig>) {
    let session_id = uuid::Uuid::new_v4();

    let upstream = match TcpStream::connect(config.upstream_addr.as_str()).await {
        Ok(stream) => stream,
        Err(err) => {
            // Dropping `client` closes it; retrying is the supervisor's job.
            tracing::warn!(
                %session_id,
                %remote_addr,
                upstream = %config.upstream_addr,
                %err,
                "upstream connect failed; closing client"
            );
            return;
        }
    };

    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    tracing::debug!(%session_id, %remote_addr, "forwarding session opened");

    match relay(client, upstream).await {
        Ok(stats) => {
            tracing::debug!(
                %session_id,
                %remote_addr,
                upstream_bytes = stats.upstream_bytes,
                downstream_bytes = stats.downstream_bytes,
                "forwarding session closed"
            );
        }
        Err(err) => {
            tracing::debug!(%session_id, %remote_addr, %err, "forwarding session aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const WAIT: Duration = Duration::from_secs(5);

    /// Start a forwarder on an ephemeral port toward `upstream_addr`.
    async fn start_forwarder(upstream_addr: String) -> SocketAddr {
        let forwarder = Forwarder::new(ForwardConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_addr,
        });
        let bound = forwarder.bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        tokio::spawn(bound.run());
        addr
    }

    /// Upstream that echoes everything back until the client half-closes.
    async fn start_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn bytes_round_trip_in_order() {
        let upstream = start_echo_upstream().await;
        let addr = start_forwarder(upstream.to_string()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        let (mut r, mut w) = client.split();
        let write = async {
            w.write_all(&payload).await.unwrap();
            w.shutdown().await.unwrap();
        };
        let mut echoed = Vec::new();
        let read = r.read_to_end(&mut echoed);
        let (_, read_result) = tokio::time::timeout(WAIT, async { tokio::join!(write, read) })
            .await
            .expect("round trip timed out");
        read_result.unwrap();

        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn client_close_reaches_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream = listener.local_addr().unwrap();
        let addr = start_forwarder(upstream.to_string()).await;

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut agent, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();

        drop(client);

        let mut rest = Vec::new();
        let n = tokio::time::timeout(WAIT, agent.read_to_end(&mut rest))
            .await
            .expect("upstream never observed the client close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_closes_client_and_keeps_listening() {
        // Reserve a port and release it so nothing is listening there.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let addr = start_forwarder(dead_addr.to_string()).await;

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = Vec::new();
            let read = tokio::time::timeout(WAIT, client.read_to_end(&mut buf))
                .await
                .expect("client was left hanging");
            // Either a clean EOF or a reset is acceptable; no data is.
            if let Ok(n) = read {
                assert_eq!(n, 0);
            }
        }
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forwarder = Forwarder::new(ForwardConfig {
            listen_addr: taken.local_addr().unwrap(),
            upstream_addr: "127.0.0.1:1".to_string(),
        });
        assert!(forwarder.bind().await.is_err());
    }
}
