use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{handle_request, parse_request, request_id, FileResponse};
use crate::workspace::Workspace;

/// Configuration for the file-operation bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address to bind the WebSocket listener to.
    pub listen_addr: SocketAddr,
    /// Workspace every request is resolved against.
    pub workspace: Workspace,
}

/// The WebSocket file-operation server.
///
/// Accepts browser WebSocket connections and answers each `list` / `read`
/// request with exactly one response on the same connection. Sessions share
/// nothing except the read-only workspace.
pub struct Bridge {
    config: Arc<BridgeConfig>,
}

/// A bridge whose listening socket is already bound.
pub struct BoundBridge {
    listener: TcpListener,
    config: Arc<BridgeConfig>,
}

impl Bridge {
    /// Create a new bridge with the given configuration.
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Bind the listening socket without starting the accept loop.
    pub async fn bind(&self) -> std::io::Result<BoundBridge> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        Ok(BoundBridge {
            listener,
            config: Arc::clone(&self.config),
        })
    }

    /// Bind and run the bridge. Only returns if binding fails.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.bind().await?.run().await;
        Ok(())
    }
}

impl BoundBridge {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Loop forever accepting connections. Each connection is handled in its
    /// own Tokio task.
    pub async fn run(self) {
        tracing::info!(
            addr = %self.config.listen_addr,
            root = %self.config.workspace.root().display(),
            "file-bridge listening"
        );

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed; continuing");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, config).await {
                    tracing::debug!(%remote_addr, %err, "bridge connection ended with error");
                }
            });
        }
    }
}

/// Handle a single WebSocket session from handshake through close.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: Arc<BridgeConfig>,
) -> anyhow::Result<()> {
    let connection_id = uuid::Uuid::new_v4();
    let ws = tokio_tungstenite::accept_async(stream).await?;

    tracing::info!(%connection_id, %remote_addr, "bridge client connected");

    let (mut writer, mut reader) = ws.split();

    // Requests are handled one at a time, so responses leave in the order
    // requests arrived.
    while let Some(msg_result) = reader.next().await {
        let msg = match msg_result {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(%connection_id, %err, "read error, closing session");
                break;
            }
        };

        let response = match msg {
            Message::Text(text) => match parse_request(text.as_str()) {
                Ok(request) => {
                    tracing::debug!(%connection_id, op = ?request.op, "file request");
                    handle_request(&config.workspace, request).await
                }
                Err(err) => {
                    tracing::debug!(%connection_id, %err, "malformed request");
                    FileResponse::malformed(request_id(text.as_str()), err.to_string())
                }
            },
            Message::Binary(_) => FileResponse::malformed(None, "binary frames are not supported"),
            Message::Close(_) => break,
            // Ping/pong are answered by tungstenite itself.
            _ => continue,
        };

        let json = serde_json::to_string(&response)?;
        if writer.send(Message::text(json)).await.is_err() {
            break;
        }
    }

    tracing::info!(%connection_id, %remote_addr, "bridge client disconnected");
    Ok(())
}
