//! WebSocket front end of the relay.
//!
//! ```text
//!  socket A ──► conn task A ──┐                     ┌──► outbox A ──► conn task A ──► socket A
//!  socket B ──► conn task B ──┼──► relay task ──────┼──► outbox B ──► conn task B ──► socket B
//!  socket C ──► conn task C ──┘  (SessionRegistry)  └──► outbox C ──► conn task C ──► socket C
//! ```
//!
//! Each connection task decodes frames into [`ClientMessage`]s for the relay
//! and writes whatever the relay queues in its outbox back to the socket. A
//! connection that closes, errors or falls behind is disconnected from the
//! relay; nothing else is affected.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage, WireFormat};
use crate::registry::SessionRegistry;
use crate::relay::{spawn_relay, ConnectionId, RelayError, RelayHandle};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Messages queued per connection before it counts as lagging
    pub outbox_capacity: usize,
    /// Relay command queue length
    pub command_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            outbox_capacity: 256,
            command_capacity: 1024,
        }
    }
}

/// Transport-level counters. Room state lives in [`crate::relay::RelayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// The relay server. Cheap to clone; clones share the relay.
#[derive(Debug, Clone)]
pub struct CollabServer {
    config: ServerConfig,
    relay: RelayHandle,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Spawn the relay task. Must be called within a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let relay = spawn_relay(SessionRegistry::new(), config.command_capacity);
        Self {
            config,
            relay,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let outbox_capacity = self.config.outbox_capacity;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, relay, stats, outbox_capacity).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: RelayHandle,
        stats: Arc<RwLock<ServerStats>>,
        outbox_capacity: usize,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        let (outbox, outbox_rx) = mpsc::channel(outbox_capacity);
        let connection_id = relay.connect(outbox).await?;
        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, addr, connection_id, &relay, outbox_rx, &stats).await;

        // The relay may already have dropped us; either way we are gone.
        let _ = relay.disconnect(connection_id).await;
        stats.write().await.active_connections -= 1;
        log::info!("Connection {connection_id} from {addr} closed");

        result
    }

    /// Shuttle frames until either side goes away.
    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        connection_id: ConnectionId,
        relay: &RelayHandle,
        mut outbox_rx: mpsc::Receiver<ServerMessage>,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        // Replies follow the encoding of the last well-formed frame.
        let mut format = WireFormat::Binary;

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let (decoded, frame_format, len) = match frame {
                        Some(Ok(Message::Binary(data))) => {
                            (ClientMessage::decode(&data), WireFormat::Binary, data.len())
                        }
                        Some(Ok(Message::Text(text))) => {
                            (ClientMessage::from_json(text.as_str()), WireFormat::Json, text.len())
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    match decoded {
                        Ok(message) => {
                            format = frame_format;
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += len as u64;
                            }
                            log::debug!("Connection {connection_id}: {} for room {}", message.event_name(), message.room_id());
                            relay.send(connection_id, message).await?;
                        }
                        Err(e) => {
                            stats.write().await.malformed_frames += 1;
                            log::warn!("Dropping malformed frame from {addr}: {e}");
                        }
                    }
                }

                outgoing = outbox_rx.recv() => {
                    let Some(message) = outgoing else {
                        log::warn!("Relay dropped connection {connection_id} from {addr}");
                        break;
                    };
                    match encode_frame(&message, format) {
                        Ok(frame) => ws_sender.send(frame).await?,
                        Err(e) => log::warn!("Failed to encode {}: {e}", message.event_name()),
                    }
                }
            }
        }

        let _ = ws_sender.close().await;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Handle to the relay, e.g. for in-process clients.
    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

fn encode_frame(message: &ServerMessage, format: WireFormat) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Binary => Message::Binary(message.encode()?.into()),
        WireFormat::Json => Message::Text(message.to_json()?.into()),
    })
}
