//! # codesync-collab: shared code editor for interview rooms
//!
//! Participants in a room edit one plain-text buffer. There is no merge: the
//! relay keeps the last code it saw per room and fans every accepted change
//! out to the other members.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌──────────────┐
//! │ SessionClient │ ◄────────────────► │ CollabServer │
//! │ (per user)    │  bincode / JSON    │ (central)    │
//! └──────┬────────┘                    └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌──────────────┐
//! │ EditorBuffer  │                    │ Relay task   │
//! │ + Debouncer   │                    │ (one owner)  │
//! └──────┬────────┘                    └──────┬───────┘
//!        │ save / load                        │
//!        ▼                                    ▼
//! ┌───────────────┐                    ┌──────────────────┐
//! │ DraftStore    │                    │ SessionRegistry  │
//! └───────────────┘                    │ room → snapshot  │
//!                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: room-scoped events and their wire encodings
//! - [`registry`]: per-room snapshot cache
//! - [`relay`]: membership, bootstrap and last-writer-wins fan-out
//! - [`server`]: WebSocket front end for the relay
//! - [`editor`]: echo suppression and edit debouncing
//! - [`client`]: a participant's session
//! - [`storage`]: saved drafts (memory and RocksDB)
//! - [`runner`]: Judge0 execution and grading
//!
//! ## Joining a room
//!
//! 1. The client sends `join-room`.
//! 2. If the relay has a snapshot it sends it straight back (`send-code`).
//! 3. Otherwise the other members get `request-latest-code`; the first
//!    `provide-code` answer becomes the snapshot and is relayed to everyone
//!    else. The first member of a new room gets nothing and keeps its own
//!    buffer.

pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod editor;
pub mod client;
pub mod language;
pub mod storage;
pub mod runner;

pub use protocol::{
    ClientMessage, ProtocolError, RoomId, ServerMessage, WireFormat, MAX_FRAME_BYTES,
};
pub use registry::SessionRegistry;
pub use relay::{spawn_relay, ConnectionId, Relay, RelayCommand, RelayError, RelayHandle, RelayStats};
pub use server::{CollabServer, ServerConfig, ServerError, ServerStats};
pub use editor::{Debouncer, EditorBuffer, LocalChange, DEBOUNCE_WINDOW, DEFAULT_CODE};
pub use client::{ClientError, ConnectionState, SessionClient, SessionEvent, Transport};
pub use language::{Language, UnknownLanguage};
pub use storage::{
    Draft, DraftKey, DraftRecord, DraftStore, MemoryDraftStore, RocksDraftStore, StoreConfig,
    StoreError, Verdict,
};
pub use runner::{
    grade, CaseResult, CodeRunner, GradeReport, Judge0Config, Judge0Runner, RunError, RunOutput,
    RunRequest, TestCase,
};
