//! Room relay: the single owner of room membership and the session registry.
//!
//! ```text
//!  conn task A ──┐                          ┌──► outbox A ──► socket A
//!  conn task B ──┼── RelayCommand (mpsc) ──►│ Relay │──► outbox B ──► socket B
//!  conn task C ──┘                          └──► outbox C ──► socket C
//!                                               │
//!                                        SessionRegistry
//! ```
//!
//! Every mutation goes through one task draining one queue, so commands are
//! applied strictly in arrival order and the registry needs no lock. Edits are
//! last-writer-wins: whichever `code-change` the relay processes last is the
//! room's snapshot. The relay never waits on a client. Outboxes are bounded
//! and written with `try_send`. A connection whose outbox is full or closed is
//! dropped from its room, the same as a transport error.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

use crate::protocol::{ClientMessage, RoomId, ServerMessage};
use crate::registry::SessionRegistry;

/// Relay-assigned connection handle.
pub type ConnectionId = u64;

/// Per-connection queue of messages waiting to be written to the socket.
pub type Outbox = mpsc::Sender<ServerMessage>;

/// Counters for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub active_connections: usize,
    pub active_rooms: usize,
    pub snapshots: usize,
    pub joins: u64,
    pub bootstrap_requests: u64,
    pub snapshots_served: u64,
    pub edits_applied: u64,
    pub dropped_connections: u64,
}

/// Relay state. Owned by exactly one task (see [`spawn_relay`]); the methods
/// are synchronous so the state machine can also be driven directly.
pub struct Relay {
    registry: SessionRegistry,
    /// Members per room, in join order
    rooms: HashMap<RoomId, Vec<ConnectionId>>,
    /// The single active room of each connection
    memberships: HashMap<ConnectionId, RoomId>,
    outboxes: HashMap<ConnectionId, Outbox>,
    next_connection_id: ConnectionId,
    stats: RelayStats,
}

impl Relay {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            outboxes: HashMap::new(),
            next_connection_id: 0,
            stats: RelayStats::default(),
        }
    }

    /// Register a connection. It belongs to no room until it sends `join-room`.
    pub fn connect(&mut self, outbox: Outbox) -> ConnectionId {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        self.outboxes.insert(connection_id, outbox);
        log::debug!("Connection {connection_id} registered");
        connection_id
    }

    /// Dispatch one inbound message.
    pub fn handle(&mut self, from: ConnectionId, message: ClientMessage) {
        if !self.outboxes.contains_key(&from) {
            log::debug!(
                "Ignoring {} from unknown connection {from}",
                message.event_name()
            );
            return;
        }

        match message {
            ClientMessage::JoinRoom { room_id } => self.join(from, room_id),
            ClientMessage::ProvideCode { room_id, code } => {
                self.provide_snapshot(from, room_id, code)
            }
            ClientMessage::CodeChange { room_id, code } => self.edit(from, room_id, code),
        }
    }

    /// Add `from` to the room. A cached snapshot goes to the joiner alone;
    /// otherwise every other member is asked for its buffer.
    pub fn join(&mut self, from: ConnectionId, room_id: RoomId) {
        if let Some(previous) = self.memberships.get(&from) {
            if previous != &room_id {
                let previous = previous.clone();
                log::debug!("Connection {from} leaves room {previous} to join {room_id}");
                self.remove_member(from, &previous);
            }
        }

        let members = self.rooms.entry(room_id.clone()).or_default();
        if !members.contains(&from) {
            members.push(from);
        }
        self.memberships.insert(from, room_id.clone());
        self.stats.joins += 1;
        log::info!(
            "Connection {from} joined room {room_id} ({} members)",
            self.members(&room_id).len()
        );

        match self.registry.get(&room_id).map(str::to_owned) {
            Some(snapshot) => {
                self.stats.snapshots_served += 1;
                self.send_to(from, ServerMessage::send_code(snapshot));
            }
            None => {
                self.stats.bootstrap_requests += 1;
                log::debug!("Room {room_id} has no snapshot, asking peers");
                self.broadcast_except(&room_id, from, ServerMessage::RequestLatestCode);
            }
        }
    }

    /// A peer's answer to a bootstrap request. Only the first answer is
    /// cached, but every answer is relayed to the other members.
    pub fn provide_snapshot(&mut self, from: ConnectionId, room_id: RoomId, code: String) {
        if !self.registry.contains(&room_id) {
            log::debug!("Room {room_id} bootstrapped from connection {from}");
            self.registry.set(room_id.clone(), code.clone());
        }
        self.broadcast_except(&room_id, from, ServerMessage::send_code(code));
    }

    /// Last-writer-wins overwrite, relayed to everyone but the sender.
    pub fn edit(&mut self, from: ConnectionId, room_id: RoomId, code: String) {
        if self.memberships.get(&from) != Some(&room_id) {
            log::debug!("Connection {from} edits room {room_id} without being a member");
        }
        self.registry.set(room_id.clone(), code.clone());
        self.stats.edits_applied += 1;
        log::trace!("Room {room_id} edited by {from} ({} bytes)", code.len());
        self.broadcast_except(&room_id, from, ServerMessage::code_sync(code));
    }

    /// Forget a connection. The room's snapshot is left untouched.
    /// Returns `false` if the connection was already gone.
    pub fn disconnect(&mut self, from: ConnectionId) -> bool {
        let known = self.outboxes.remove(&from).is_some();
        if let Some(room_id) = self.memberships.get(&from).cloned() {
            self.remove_member(from, &room_id);
        }
        if known {
            log::info!("Connection {from} disconnected");
        }
        known
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Current members of a room, in join order.
    pub fn members(&self, room_id: &RoomId) -> &[ConnectionId] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn room_of(&self, connection_id: ConnectionId) -> Option<&RoomId> {
        self.memberships.get(&connection_id)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            active_connections: self.outboxes.len(),
            active_rooms: self.rooms.len(),
            snapshots: self.registry.len(),
            ..self.stats.clone()
        }
    }

    fn apply(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Connect { outbox, reply } => {
                let connection_id = self.connect(outbox);
                if reply.send(connection_id).is_err() {
                    self.disconnect(connection_id);
                }
            }
            RelayCommand::Message { from, message } => self.handle(from, message),
            RelayCommand::Disconnect { from } => {
                self.disconnect(from);
            }
            RelayCommand::Snapshot { room_id, reply } => {
                let _ = reply.send(self.registry.get(&room_id).map(str::to_owned));
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn remove_member(&mut self, from: ConnectionId, room_id: &RoomId) {
        self.memberships.remove(&from);
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.retain(|member| *member != from);
            if members.is_empty() {
                self.rooms.remove(room_id);
                log::debug!("Room {room_id} has no members left");
            }
        }
    }

    fn send_to(&mut self, to: ConnectionId, message: ServerMessage) {
        let Some(outbox) = self.outboxes.get(&to) else {
            return;
        };
        match outbox.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                log::warn!(
                    "Connection {to} is lagging, dropping it instead of queueing {}",
                    message.event_name()
                );
                self.stats.dropped_connections += 1;
                self.disconnect(to);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {to} outbox closed");
                self.stats.dropped_connections += 1;
                self.disconnect(to);
            }
        }
    }

    fn broadcast_except(&mut self, room_id: &RoomId, except: ConnectionId, message: ServerMessage) {
        let targets: Vec<ConnectionId> = self
            .members(room_id)
            .iter()
            .copied()
            .filter(|member| *member != except)
            .collect();
        for target in targets {
            self.send_to(target, message.clone());
        }
    }
}

/// Commands accepted by the relay task.
#[derive(Debug)]
pub enum RelayCommand {
    Connect {
        outbox: Outbox,
        reply: oneshot::Sender<ConnectionId>,
    },
    Message {
        from: ConnectionId,
        message: ClientMessage,
    },
    Disconnect {
        from: ConnectionId,
    },
    Snapshot {
        room_id: RoomId,
        reply: oneshot::Sender<Option<String>>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Relay task has stopped")]
    Stopped,
}

/// Cloneable handle to a running relay task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    pub async fn connect(&self, outbox: Outbox) -> Result<ConnectionId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.command(RelayCommand::Connect { outbox, reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    pub async fn send(&self, from: ConnectionId, message: ClientMessage) -> Result<(), RelayError> {
        self.command(RelayCommand::Message { from, message }).await
    }

    pub async fn disconnect(&self, from: ConnectionId) -> Result<(), RelayError> {
        self.command(RelayCommand::Disconnect { from }).await
    }

    /// Read a room's snapshot through the relay queue.
    pub async fn snapshot(&self, room_id: impl Into<RoomId>) -> Result<Option<String>, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.command(RelayCommand::Snapshot {
            room_id: room_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.command(RelayCommand::Stats { reply }).await?;
        rx.await.map_err(|_| RelayError::Stopped)
    }

    async fn command(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.tx.send(command).await.map_err(|_| RelayError::Stopped)
    }
}

/// Spawn the relay task. It runs until every [`RelayHandle`] is dropped.
pub fn spawn_relay(registry: SessionRegistry, command_capacity: usize) -> RelayHandle {
    let (tx, mut rx) = mpsc::channel::<RelayCommand>(command_capacity);

    tokio::spawn(async move {
        let mut relay = Relay::new(registry);
        while let Some(command) = rx.recv().await {
            relay.apply(command);
        }
        log::info!("Relay stopped");
    });

    RelayHandle { tx }
}
