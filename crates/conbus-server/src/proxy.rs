//! Broadcasting reverse proxy.
//!
//! Sits on the gateway port, opens one upstream connection per accepted
//! client and relays bytes both ways without modification. Every byte the
//! upstream sends is additionally mirrored to every other connected
//! client, so passive observers (protocol monitors, loggers) see the live
//! bus without owning the gateway socket. Each relayed frame is printed
//! with a millisecond timestamp.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use conbus_proto::FrameParser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::buffers::{ClientBufferManager, DEFAULT_BUFFER_CAPACITY};
use crate::error::ServerError;

/// Proxy runtime parameters.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub bind_address: String,
    /// Upstream gateway, `host:port`.
    pub upstream: String,
    /// Per-client buffer soft cap, in frames.
    pub buffer_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", conbus_proto::GATEWAY_PORT),
            upstream: format!("127.0.0.1:{}", conbus_proto::GATEWAY_PORT + 1),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// A running reverse proxy.
pub struct BroadcastProxy {
    listener: TcpListener,
    upstream: String,
    buffers: Arc<ClientBufferManager>,
}

impl BroadcastProxy {
    /// Bind the listen socket.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            ServerError::Transport(format!("cannot bind {}: {e}", config.bind_address))
        })?;
        tracing::info!(
            address = %config.bind_address,
            upstream = %config.upstream,
            "proxy bound"
        );
        Ok(Self {
            listener,
            upstream: config.upstream,
            buffers: Arc::new(ClientBufferManager::new(config.buffer_capacity)),
        })
    }

    /// The actual listen address, useful with port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("no local address: {e}")))
    }

    /// Accept clients until the process dies.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (client, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))?;
            tracing::info!(%peer, "observer connected");

            let upstream = match TcpStream::connect(&self.upstream).await {
                Ok(upstream) => upstream,
                Err(error) => {
                    tracing::warn!(%error, upstream = %self.upstream, "upstream unreachable");
                    continue;
                }
            };

            let (id, mut rx) = self.buffers.register();
            let (client_read, mut client_write) = client.into_split();
            let (upstream_read, mut upstream_write) = upstream.into_split();

            // Mirror queue to this client.
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    if client_write.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
            });

            // Client to upstream, logged frame by frame.
            let buffers = Arc::clone(&self.buffers);
            tokio::spawn(async move {
                relay_upstream(client_read, upstream_write, peer).await;
                // The client is gone once its upstream leg ends.
                buffers.unregister(id);
            });

            // Upstream to every observer.
            let buffers = Arc::clone(&self.buffers);
            tokio::spawn(async move {
                mirror_downstream(upstream_read, buffers).await;
            });
        }
    }
}

/// Copy client bytes to its upstream, logging each complete frame.
async fn relay_upstream(
    mut client_read: OwnedReadHalf,
    mut upstream_write: tokio::net::tcp::OwnedWriteHalf,
    peer: std::net::SocketAddr,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        match client_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if upstream_write.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                parser.push(&buf[..n]);
                while let Some(telegram) = parser.next_frame() {
                    tracing::info!(
                        "{} [CLIENT→PROXY] {}",
                        wall_clock(),
                        telegram.frame_display()
                    );
                    tracing::info!(
                        "{} [PROXY→SERVER] {}",
                        wall_clock(),
                        telegram.frame_display()
                    );
                }
            }
        }
    }
    tracing::info!(%peer, "observer disconnected");
}

/// Broadcast upstream bytes to every observer, logging each frame.
async fn mirror_downstream(mut upstream_read: OwnedReadHalf, buffers: Arc<ClientBufferManager>) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    loop {
        match upstream_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffers.broadcast(&buf[..n]);
                parser.push(&buf[..n]);
                while let Some(telegram) = parser.next_frame() {
                    tracing::info!(
                        "{} [SERVER→PROXY] {}",
                        wall_clock(),
                        telegram.frame_display()
                    );
                }
            }
        }
    }
}

/// `HH:MM:SS,mmm` wall clock (UTC), the format the bus tooling expects.
fn wall_clock() -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let secs = now.as_secs();
    format!(
        "{:02}:{:02}:{:02},{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    )
}
