//! # numcall-sync — shared number boards with spoken call-outs
//!
//! A server keeps three categorized lists of numbers and relays every
//! change to all connected stations; each station mirrors the lists and
//! announces new numbers through a speech backend.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket       ┌──────────────┐
//! │ CallStation  │ ◄─────────────────► │ SyncServer   │
//! │ (per client) │  bincode / JSON     │ (central)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Reconciler   │                     │ Hub (mutex)  │
//! │ + Announcer  │                     │ CategoryStore│
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                            ┌───────┴────────┐
//! ┌──────────────┐                    │ broadcast +    │
//! │ Speaker      │                    │ SessionRegistry│
//! └──────────────┘                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`category`] — the closed set of categories and value validation
//! - [`store`] — authoritative ordered lists with stable entry ids
//! - [`protocol`] — wire messages, codecs and connection parameters
//! - [`session`] — disconnect-recovery sessions with replay buffers
//! - [`broadcast`] — the single-writer hub and event fan-out
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket client transport with offline queue
//! - [`reconciler`] — client mirror, echo dedup and announce-once
//! - [`announcer`] — periodic spoken summary
//! - [`speech`] — speech output seam
//! - [`station`] — client runtime tying it together
//! - [`config`] — server and station settings

pub mod category;
pub mod store;
pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod reconciler;
pub mod announcer;
pub mod speech;
pub mod station;
pub mod config;

// Re-exports for convenience
pub use category::{Category, EntryKey, InvalidCategory, ValidationError};
pub use store::{CategoryStore, Entry, EntryId, StoreError, StoreSnapshot};
pub use protocol::{
    Added, BoardEvent, ClientMessage, ConnectParams, ProtocolError, Removed,
    ResumeToken, ServerMessage, WireFormat,
};
pub use broadcast::{Hub, HubError, HubStats, Mutation};
pub use server::{ServerStats, SyncServer};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use reconciler::{DeleteAddressing, LinkState, ReconcileError, Reconciler};
pub use announcer::{compose_summary, Announcer};
pub use speech::{CommandSpeaker, LogSpeaker, RecordingSpeaker, Speaker};
pub use station::{CallStation, StationError, StationHandle, StationView};
pub use config::{ConfigError, OriginPolicy, ServerConfig, StationConfig};
