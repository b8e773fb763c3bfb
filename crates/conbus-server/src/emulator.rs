//! The gateway emulator.
//!
//! A multi-client TCP server: every accepted socket gets a reader task
//! that parses frames and feeds the device table, and a writer task that
//! drains the client's broadcast buffer with a randomized inter-send
//! delay. Every frame any module produces is broadcast to every connected
//! client, exactly like the real gateway mirrors bus traffic.

use std::sync::{Arc, Mutex, PoisonError};

use conbus_proto::FrameParser;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

use crate::buffers::ClientBufferManager;
use crate::config::EmulatorConfig;
use crate::device::{DeviceReply, DeviceTable};
use crate::error::ServerError;

/// A running emulator bound to its listen address.
pub struct EmulatorServer {
    listener: TcpListener,
    devices: Arc<Mutex<DeviceTable>>,
    buffers: Arc<ClientBufferManager>,
    write_delay: (Duration, Duration),
}

impl EmulatorServer {
    /// Bind the listen socket and build the device table.
    pub async fn bind(config: EmulatorConfig) -> Result<Self, ServerError> {
        let devices = DeviceTable::from_definitions(&config.definitions)?;
        let listener = TcpListener::bind(&config.bind_address).await.map_err(|e| {
            ServerError::Transport(format!("cannot bind {}: {e}", config.bind_address))
        })?;
        tracing::info!(
            address = %config.bind_address,
            modules = devices.len(),
            "emulator bound"
        );
        Ok(Self {
            listener,
            devices: Arc::new(Mutex::new(devices)),
            buffers: Arc::new(ClientBufferManager::new(config.buffer_capacity)),
            write_delay: (config.write_delay_min, config.write_delay_max),
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
            let (socket, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| ServerError::Transport(format!("accept failed: {e}")))?;
            if let Err(error) = socket.set_nodelay(true) {
                tracing::debug!(%error, "cannot disable Nagle");
            }
            let (id, rx) = self.buffers.register();
            tracing::info!(%peer, client = id, "client connected");

            let (read_half, write_half) = socket.into_split();
            tokio::spawn(drain_buffer(rx, write_half, self.write_delay));
            tokio::spawn(serve_client(
                read_half,
                id,
                peer,
                Arc::clone(&self.devices),
                Arc::clone(&self.buffers),
            ));
        }
    }
}

/// Writer task: drain one client's buffer with paced writes.
async fn drain_buffer(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: OwnedWriteHalf,
    (min, max): (Duration, Duration),
) {
    let mut frames_out = 0u64;
    while let Some(frame) = rx.recv().await {
        let delay = if max > min { rand::thread_rng().gen_range(min..=max) } else { min };
        sleep(delay).await;
        if writer.write_all(&frame).await.is_err() {
            break;
        }
        frames_out += 1;
    }
    tracing::debug!(frames_out, "writer drained");
}

/// Reader task: parse inbound frames and feed the device table.
async fn serve_client(
    mut reader: OwnedReadHalf,
    id: u64,
    peer: std::net::SocketAddr,
    devices: Arc<Mutex<DeviceTable>>,
    buffers: Arc<ClientBufferManager>,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; 4096];
    let mut frames_in = 0u64;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                parser.push(&buf[..n]);
                while let Some(telegram) = parser.next_frame() {
                    frames_in += 1;
                    if !telegram.checksum_valid() {
                        tracing::debug!(
                            frame = %telegram.frame_display(),
                            "handling frame with bad checksum"
                        );
                    }
                    let replies = devices
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .handle(&telegram);
                    for reply in replies {
                        dispatch(&buffers, reply);
                    }
                }
            }
        }
    }
    buffers.unregister(id);
    tracing::info!(%peer, client = id, frames_in, "client disconnected");
}

/// Execute one device effect against the broadcast buffers.
fn dispatch(buffers: &Arc<ClientBufferManager>, reply: DeviceReply) {
    match reply {
        DeviceReply::Frame(frame) => {
            buffers.broadcast(&frame);
        }
        DeviceReply::Burst { frame, copies, spacing } => {
            let buffers = Arc::clone(buffers);
            tokio::spawn(async move {
                tracing::warn!(copies, "storm burst starting");
                for _ in 0..copies {
                    buffers.broadcast(&frame);
                    sleep(spacing).await;
                }
            });
        }
    }
}
