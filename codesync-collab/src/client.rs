//! Editing session client.
//!
//! A [`SessionClient`] is one participant in one room. It keeps the local
//! [`EditorBuffer`], answers bootstrap requests with that buffer, applies
//! remote content, and sends local edits through a [`Debouncer`]. It talks to
//! the relay through a [`Transport`], which is a pair of channels. The
//! transport is backed either by a WebSocket or directly by an in-process
//! [`RelayHandle`].
//!
//! Disconnection is terminal. A client never reconnects on its own; joining
//! again means building a new client and bootstrapping again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::editor::{Debouncer, EditorBuffer, LocalChange, DEBOUNCE_WINDOW};
use crate::language::Language;
use crate::protocol::{ClientMessage, RoomId, ServerMessage};
use crate::relay::{RelayError, RelayHandle};
use crate::storage::{Draft, DraftKey, DraftStore, StoreError, Verdict};

/// Buffer size of the transport and event channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The buffer was replaced by content from the relay. The widget should
    /// show it; the change notification it fires in response is swallowed.
    RemoteUpdate(String),
    /// A peer's bootstrap request was answered with our buffer.
    SnapshotProvided,
    /// The relay connection is gone.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Channel pair between a client and the relay.
pub struct Transport {
    outgoing: mpsc::Sender<ClientMessage>,
    incoming: mpsc::Receiver<ServerMessage>,
    /// Task feeding `incoming`, aborted on teardown
    reader: Option<JoinHandle<()>>,
}

impl Transport {
    /// Wrap caller-owned channels.
    pub fn from_channels(
        outgoing: mpsc::Sender<ClientMessage>,
        incoming: mpsc::Receiver<ServerMessage>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            reader: None,
        }
    }

    /// Open a WebSocket to the relay server.
    ///
    /// Outgoing messages are bincode in binary frames. Incoming binary and
    /// text frames are both accepted. Once every sender of the outgoing side
    /// is dropped, the writer closes the socket.
    pub async fn websocket(url: &str, capacity: usize) -> Result<Self, ClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(capacity);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let encoded = match message.encode() {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::warn!("Failed to encode {}: {e}", message.event_name());
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let decoded = match frame {
                    Ok(Message::Binary(data)) => ServerMessage::decode(&data),
                    Ok(Message::Text(text)) => ServerMessage::from_json(text.as_str()),
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                match decoded {
                    Ok(message) => {
                        if in_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping malformed frame from relay: {e}"),
                }
            }
        });

        Ok(Self {
            outgoing: out_tx,
            incoming: in_rx,
            reader: Some(reader),
        })
    }

    /// Attach directly to a relay running in this process.
    ///
    /// The relay sees an ordinary connection; when the client side drops its
    /// sender the connection is disconnected.
    pub async fn in_process(relay: &RelayHandle, capacity: usize) -> Result<Self, ClientError> {
        let (outbox, incoming) = mpsc::channel(capacity);
        let connection_id = relay.connect(outbox).await?;

        let (outgoing, mut out_rx) = mpsc::channel::<ClientMessage>(capacity);
        let relay = relay.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if relay.send(connection_id, message).await.is_err() {
                    return;
                }
            }
            let _ = relay.disconnect(connection_id).await;
        });

        Ok(Self {
            outgoing,
            incoming,
            reader: None,
        })
    }
}

/// One participant's editing session.
pub struct SessionClient {
    room_id: RoomId,
    buffer: Arc<Mutex<EditorBuffer>>,
    /// `None` once the session has been torn down
    outgoing: Option<mpsc::Sender<ClientMessage>>,
    debouncer: Debouncer,
    dispatcher: Option<JoinHandle<()>>,
    transport_reader: Option<JoinHandle<()>>,
    state: Arc<RwLock<ConnectionState>>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl SessionClient {
    /// Connect to a relay server over WebSocket and join `room_id`.
    pub async fn connect(url: &str, room_id: impl Into<RoomId>) -> Result<Self, ClientError> {
        let transport = Transport::websocket(url, DEFAULT_CHANNEL_CAPACITY).await?;
        Self::join(transport, room_id, DEBOUNCE_WINDOW).await
    }

    /// Announce the join and start handling relay events.
    pub async fn join(
        transport: Transport,
        room_id: impl Into<RoomId>,
        debounce_window: Duration,
    ) -> Result<Self, ClientError> {
        let room_id = room_id.into();
        let Transport {
            outgoing,
            incoming,
            reader,
        } = transport;

        outgoing
            .send(ClientMessage::join_room(room_id.clone()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        log::info!("Joining room {room_id}");

        let buffer = Arc::new(Mutex::new(EditorBuffer::default()));
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let (event_tx, event_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        let dispatcher = tokio::spawn(dispatch(
            room_id.clone(),
            incoming,
            outgoing.clone(),
            buffer.clone(),
            state.clone(),
            event_tx,
        ));

        Ok(Self {
            room_id,
            buffer,
            outgoing: Some(outgoing),
            debouncer: Debouncer::new(debounce_window),
            dispatcher: Some(dispatcher),
            transport_reader: reader,
            state,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Change notification from the widget.
    ///
    /// Echoes of a remote update are swallowed. Anything else (re)starts the
    /// debounce timer with this content; only the last edit in a window is
    /// sent as `code-change`.
    pub async fn local_change(&mut self, content: impl Into<String>) -> LocalChange {
        let content = content.into();
        let outcome = self.buffer.lock().await.local_change(content.clone());
        if outcome == LocalChange::Suppressed {
            log::trace!("Suppressed echo of remote update in room {}", self.room_id);
            return outcome;
        }

        if let Some(outgoing) = self.outgoing.clone() {
            if *self.state.read().await == ConnectionState::Connected {
                let message = ClientMessage::code_change(self.room_id.clone(), content);
                let state = self.state.clone();
                self.debouncer.schedule(async move {
                    // The relay may have gone away while the timer ran.
                    if *state.read().await == ConnectionState::Connected {
                        let _ = outgoing.send(message).await;
                    }
                });
            }
        }
        outcome
    }

    /// Replace the buffer without broadcasting, e.g. with a saved draft.
    pub async fn seed(&self, content: impl Into<String>) {
        self.buffer.lock().await.seed(content);
    }

    pub async fn content(&self) -> String {
        self.buffer.lock().await.content().to_owned()
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether a debounced edit is still waiting to be sent.
    pub fn has_pending_edit(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Persist the current buffer. Failures are returned to the caller and
    /// leave the real-time session untouched.
    pub async fn save_draft<S>(
        &self,
        store: &S,
        key: DraftKey,
        language: Language,
        verdict: Verdict,
    ) -> Result<Uuid, StoreError>
    where
        S: DraftStore + ?Sized,
    {
        let draft = Draft {
            key,
            code: self.content().await,
            language,
            verdict,
        };
        let id = store.save(&draft)?;
        log::info!("Saved draft {id} ({}) for room {}", draft.verdict, self.room_id);
        Ok(id)
    }

    /// Tear the session down: cancel the pending edit, stop handling events
    /// and close the connection. Returns `false` if already left.
    pub async fn leave(&mut self) -> bool {
        let Some(outgoing) = self.outgoing.take() else {
            return false;
        };

        if self.debouncer.cancel() {
            log::debug!("Discarded pending edit for room {}", self.room_id);
        }
        self.abort_tasks();
        drop(outgoing);
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Left room {}", self.room_id);
        true
    }

    fn abort_tasks(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
        if let Some(reader) = self.transport_reader.take() {
            reader.abort();
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.debouncer.cancel();
        self.abort_tasks();
    }
}

/// Handle relay events until the transport closes.
async fn dispatch(
    room_id: RoomId,
    mut incoming: mpsc::Receiver<ServerMessage>,
    outgoing: mpsc::Sender<ClientMessage>,
    buffer: Arc<Mutex<EditorBuffer>>,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(message) = incoming.recv().await {
        log::debug!("Room {room_id}: {}", message.event_name());
        let event = match message {
            ServerMessage::RequestLatestCode => {
                let code = buffer.lock().await.content().to_owned();
                if outgoing
                    .send(ClientMessage::provide_code(room_id.clone(), code))
                    .await
                    .is_err()
                {
                    break;
                }
                Some(SessionEvent::SnapshotProvided)
            }
            ServerMessage::SendCode { code } | ServerMessage::CodeSync { code } => {
                let mut buffer = buffer.lock().await;
                if buffer.apply_remote(&code) {
                    // Undelivered updates never produce a widget echo.
                    if let Err(e) = events.try_send(SessionEvent::RemoteUpdate(code)) {
                        buffer.clear_pending_remote();
                        warn_undelivered(&room_id, &e);
                    }
                }
                None
            }
        };

        if let Some(event) = event {
            if let Err(e) = events.try_send(event) {
                warn_undelivered(&room_id, &e);
            }
        }
    }

    *state.write().await = ConnectionState::Disconnected;
    let _ = events.try_send(SessionEvent::Disconnected);
    log::info!("Relay connection for room {room_id} closed");
}

fn warn_undelivered<T>(room_id: &RoomId, error: &mpsc::error::TrySendError<T>) {
    if let mpsc::error::TrySendError::Full(_) = error {
        log::warn!("Session events for room {room_id} are not being consumed");
    }
}
