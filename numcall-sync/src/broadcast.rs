//! Single-writer hub: store mutation, sequencing and fan-out.
//!
//! ```text
//!  intent ──► Hub::apply ──► CategoryStore ──► seq += 1
//!                                   │
//!                    ┌──────────────┴──────────────┐
//!                    ▼                             ▼
//!         broadcast::Sender (live)      SessionRegistry::record
//!          │      │       │              (detached replay buffers)
//!          ▼      ▼       ▼
//!        conn A conn B  conn C   (originator included)
//! ```
//!
//! The server keeps the hub behind one mutex. Everything that must be
//! totally ordered (apply, attach, detach) happens under it, so a receiver
//! subscribed in `attach` sees exactly the events after the snapshot it
//! was greeted with.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

use crate::category::{self, Category, ValidationError};
use crate::config::ServerConfig;
use crate::protocol::{Added, BoardEvent, ClientMessage, Removed, ResumeToken, ServerMessage};
use crate::session::{Resumption, SessionRegistry};
use crate::store::{CategoryStore, EntryId, StoreError, StoreSnapshot};

/// A validated-on-apply store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Add {
        category: Category,
        value: String,
        announce_text: Option<String>,
    },
    RemoveAt {
        category: Category,
        position: usize,
    },
    RemoveById {
        category: Category,
        id: EntryId,
    },
}

impl Mutation {
    /// The mutation a client message asks for; `None` for informational messages.
    pub fn from_message(msg: ClientMessage) -> Option<Self> {
        match msg {
            ClientMessage::NumberAdded {
                category,
                value,
                announce_text,
            } => Some(Self::Add {
                category,
                value,
                announce_text,
            }),
            ClientMessage::NumberDeleted { category, position } => {
                Some(Self::RemoveAt { category, position })
            }
            ClientMessage::EntryRemoved { category, id } => Some(Self::RemoveById { category, id }),
            ClientMessage::RepeatMessage { .. } => None,
        }
    }
}

/// Why a mutation was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    Validation(ValidationError),
    Store(StoreError),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation error: {e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for HubError {}

impl From<ValidationError> for HubError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StoreError> for HubError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub seq: u64,
    pub events_applied: u64,
    pub intents_rejected: u64,
    pub live_sessions: usize,
    pub detached_sessions: usize,
}

/// What a new connection needs to start streaming.
pub struct Attachment {
    pub session: Uuid,
    /// Sent before any live event: a snapshot, or a resume notice plus replay
    pub greeting: Vec<ServerMessage>,
    pub resumed: bool,
    pub receiver: broadcast::Receiver<Arc<BoardEvent>>,
}

/// The authoritative store plus its broadcast fan-out.
pub struct Hub {
    store: CategoryStore,
    seq: u64,
    sender: broadcast::Sender<Arc<BoardEvent>>,
    sessions: SessionRegistry,
    events_applied: u64,
    intents_rejected: u64,
}

impl Hub {
    pub fn new(config: &ServerConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            store: CategoryStore::new(),
            seq: 0,
            sender,
            sessions: SessionRegistry::new(config.recovery_window, config.replay_capacity),
            events_applied: 0,
            intents_rejected: 0,
        }
    }

    /// Register a connection and build its greeting.
    pub fn attach(&mut self, resume: Option<ResumeToken>, now: Instant) -> Attachment {
        let receiver = self.sender.subscribe();
        match self.sessions.open(resume, now) {
            Resumption::Resumed { session, events } => {
                let mut greeting = Vec::with_capacity(events.len() + 1);
                greeting.push(ServerMessage::SessionResumed {
                    session,
                    replayed: events.len() as u64,
                });
                greeting.extend(events.iter().map(|e| e.to_message()));
                log::info!("Session {session} resumed, replaying {} events", events.len());
                Attachment {
                    session,
                    greeting,
                    resumed: true,
                    receiver,
                }
            }
            Resumption::Fresh { session, reason } => {
                log::info!("Session {session} opened ({reason:?})");
                Attachment {
                    session,
                    greeting: vec![self.initial_state(session)],
                    resumed: false,
                    receiver,
                }
            }
        }
    }

    /// Full snapshot message for `session`.
    pub fn initial_state(&self, session: Uuid) -> ServerMessage {
        ServerMessage::InitialState {
            session,
            seq: self.seq,
            state: self.store.snapshot(),
        }
    }

    /// Apply a mutation and fan the resulting event out.
    pub fn apply(&mut self, mutation: Mutation) -> Result<Arc<BoardEvent>, HubError> {
        let result = self.mutate(mutation);
        let event = match result {
            Ok(event) => Arc::new(event),
            Err(e) => {
                self.intents_rejected += 1;
                return Err(e);
            }
        };

        self.events_applied += 1;
        self.sessions.record(&event);
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        log::debug!("Broadcast seq {} to {receivers} receivers", event.seq());
        Ok(event)
    }

    fn mutate(&mut self, mutation: Mutation) -> Result<BoardEvent, HubError> {
        match mutation {
            Mutation::Add {
                category,
                value,
                announce_text,
            } => {
                category::validate_value(&value)?;
                let announce_text = announce_text
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| category::announce_text(category, &value));
                let (id, position) = self.store.add(category, value.clone());
                self.seq += 1;
                Ok(BoardEvent::Added(Added {
                    seq: self.seq,
                    category,
                    value,
                    id,
                    position,
                    announce_text,
                }))
            }
            Mutation::RemoveAt { category, position } => {
                let entry = self.store.remove_at(category, position)?;
                self.seq += 1;
                Ok(BoardEvent::Removed(Removed {
                    seq: self.seq,
                    category,
                    position,
                    id: entry.id,
                }))
            }
            Mutation::RemoveById { category, id } => {
                let (position, _) = self.store.remove_by_id(category, id)?;
                self.seq += 1;
                Ok(BoardEvent::Removed(Removed {
                    seq: self.seq,
                    category,
                    position,
                    id,
                }))
            }
        }
    }

    /// Detach a session whose connection ended.
    ///
    /// Events still queued in `receiver`, plus `in_flight` (taken from the
    /// receiver but not written), become the start of the replay buffer.
    /// Anything at or below `delivered_seq` was written to the socket; a
    /// resume from an older offset gets a fresh snapshot.
    pub fn detach(
        &mut self,
        session: Uuid,
        mut receiver: broadcast::Receiver<Arc<BoardEvent>>,
        in_flight: Vec<Arc<BoardEvent>>,
        delivered_seq: u64,
        now: Instant,
    ) {
        let mut undelivered = in_flight;
        loop {
            match receiver.try_recv() {
                Ok(event) => undelivered.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Session {session} lost {n} events before detach; not resumable");
                    self.sessions.forget(&session);
                    return;
                }
            }
        }
        undelivered.retain(|e| e.seq() > delivered_seq);
        log::debug!(
            "Session {session} detached with {} undelivered events",
            undelivered.len()
        );
        self.sessions.detach(session, delivered_seq, undelivered, now);
    }

    /// Forget a session that closed cleanly; it cannot be resumed.
    pub fn close(&mut self, session: Uuid) {
        self.sessions.forget(&session);
        log::debug!("Session {session} closed");
    }

    /// Drop expired detached sessions.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let dropped = self.sessions.sweep(now);
        if dropped > 0 {
            log::debug!("Swept {dropped} expired sessions");
        }
        dropped
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn store(&self) -> &CategoryStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            seq: self.seq,
            events_applied: self.events_applied,
            intents_rejected: self.intents_rejected,
            live_sessions: self.sessions.live_count(),
            detached_sessions: self.sessions.detached_count(),
        }
    }
}
