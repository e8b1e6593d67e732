//! Client-side mirror of the category store.
//!
//! ```text
//!  user add ──► validate ──► append pending ──► speak? ──► number-added
//!                                 │
//!  number-update (own echo) ──────┘ promote pending -> confirmed, silent
//!  number-update (remote)   ──────► insert confirmed, speak once per key
//!  user delete ──► remove locally ──► forget key ──► entry-removed / number-deleted
//!  number-deleted ──► drop by id (or consume own echo)
//! ```
//!
//! Each list keeps server-confirmed entries as a prefix in server order and
//! optimistic entries as a tail, so the confirmed prefix converges with the
//! authoritative list whenever no event was missed.
//!
//! Position-addressed deletes are kept for wire compatibility and keep
//! their race: if another client removed an earlier entry first, the
//! server applies the position to a shifted list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::category::{self, Category, EntryKey, ValidationError};
use crate::protocol::{Added, ClientMessage, Removed, ResumeToken, ServerMessage};
use crate::speech::Speaker;
use crate::store::{EntryId, StoreSnapshot};

/// How deletions are addressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteAddressing {
    /// `number-deleted{category, position}`: legacy, racy
    Position,
    /// `entry-removed{category, id}`
    #[default]
    Identifier,
}

impl FromStr for DeleteAddressing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "position" | "index" => Ok(Self::Position),
            "id" | "identifier" => Ok(Self::Identifier),
            other => Err(format!("expected `id` or `position`, got {other:?}")),
        }
    }
}

/// Whether the mirror is currently fed by a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for `initial-state` or `session-resumed`; events stay silent
    Syncing,
    Live,
}

/// An entry as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorEntry {
    pub value: String,
    /// `None` while the add is unconfirmed
    pub id: Option<EntryId>,
}

impl MirrorEntry {
    pub fn is_pending(&self) -> bool {
        self.id.is_none()
    }
}

/// Local rejections; nothing is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    Validation(ValidationError),
    IndexOutOfRange {
        category: Category,
        position: usize,
        len: usize,
    },
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation error: {e}"),
            Self::IndexOutOfRange {
                category,
                position,
                len,
            } => write!(f, "No entry at position {position} in {category} (len {len})"),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<ValidationError> for ReconcileError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

/// What to do when the echo of a locally deleted pending add arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnConfirm {
    /// Ask the server to remove it by its new id
    RemoveById,
    /// A position delete already went out; just don't mirror it
    Drop,
}

/// The client mirror and its dedup bookkeeping.
pub struct Reconciler {
    lists: [Vec<MirrorEntry>; 3],
    /// Own adds awaiting their echo, per key
    pending: HashMap<EntryKey, usize>,
    /// Pending adds deleted before confirmation
    cancelled: HashMap<EntryKey, VecDeque<OnConfirm>>,
    /// Confirmed ids removed locally, awaiting the server's echo
    retracted: HashSet<EntryId>,
    announced: HashSet<EntryKey>,
    muted: bool,
    link: LinkState,
    addressing: DeleteAddressing,
    session: Option<Uuid>,
    last_seq: u64,
}

impl Reconciler {
    pub fn new(addressing: DeleteAddressing) -> Self {
        Self {
            lists: [Vec::new(), Vec::new(), Vec::new()],
            pending: HashMap::new(),
            cancelled: HashMap::new(),
            retracted: HashSet::new(),
            announced: HashSet::new(),
            muted: false,
            link: LinkState::Syncing,
            addressing,
            session: None,
            last_seq: 0,
        }
    }

    /// Optimistically add `input` to `category`.
    ///
    /// Returns the intent to send; on `Err` nothing changed.
    pub fn add(
        &mut self,
        category: Category,
        input: &str,
        speaker: &mut dyn Speaker,
    ) -> Result<ClientMessage, ReconcileError> {
        category::validate_value(input)?;

        let key = EntryKey::new(category, input);
        self.lists[category.index()].push(MirrorEntry {
            value: input.to_string(),
            id: None,
        });
        *self.pending.entry(key.clone()).or_insert(0) += 1;

        let text = category::announce_text(category, input);
        self.announce(key, &text, speaker);

        Ok(ClientMessage::NumberAdded {
            category,
            value: input.to_string(),
            announce_text: Some(text),
        })
    }

    /// Delete the entry at a local position.
    ///
    /// Returns the intent to send, or `None` when the removal has to wait
    /// for the entry's confirmation.
    pub fn delete_at(
        &mut self,
        category: Category,
        position: usize,
    ) -> Result<Option<ClientMessage>, ReconcileError> {
        let list = &mut self.lists[category.index()];
        if position >= list.len() {
            return Err(ReconcileError::IndexOutOfRange {
                category,
                position,
                len: list.len(),
            });
        }
        let entry = list.remove(position);
        let key = EntryKey::new(category, entry.value);
        self.announced.remove(&key);

        let intent = match (entry.id, self.addressing) {
            (Some(id), DeleteAddressing::Identifier) => {
                self.retracted.insert(id);
                Some(ClientMessage::EntryRemoved { category, id })
            }
            (Some(id), DeleteAddressing::Position) => {
                self.retracted.insert(id);
                Some(ClientMessage::NumberDeleted { category, position })
            }
            (None, DeleteAddressing::Identifier) => {
                self.cancelled
                    .entry(key)
                    .or_default()
                    .push_back(OnConfirm::RemoveById);
                None
            }
            (None, DeleteAddressing::Position) => {
                self.cancelled.entry(key).or_default().push_back(OnConfirm::Drop);
                Some(ClientMessage::NumberDeleted { category, position })
            }
        };
        Ok(intent)
    }

    /// Apply a server message. Returns follow-up intents to send.
    pub fn apply(&mut self, msg: ServerMessage, speaker: &mut dyn Speaker) -> Vec<ClientMessage> {
        match msg {
            ServerMessage::InitialState {
                session,
                seq,
                state,
            } => self.reset(session, seq, &state),
            ServerMessage::SessionResumed { session, replayed } => {
                log::info!("Session {session} resumed, {replayed} events to replay");
                self.session = Some(session);
                self.link = LinkState::Live;
                Vec::new()
            }
            ServerMessage::NumberUpdate(added) => {
                if !self.advance(added.seq) {
                    return Vec::new();
                }
                self.apply_added(added, speaker).into_iter().collect()
            }
            ServerMessage::NumberDeleted(removed) => {
                if self.advance(removed.seq) {
                    self.apply_removed(removed);
                }
                Vec::new()
            }
        }
    }

    /// Record `seq` as applied; false for stale or duplicate events.
    fn advance(&mut self, seq: u64) -> bool {
        if seq <= self.last_seq {
            log::debug!("Ignoring stale event seq {seq} (at {})", self.last_seq);
            return false;
        }
        self.last_seq = seq;
        true
    }

    fn apply_added(&mut self, added: Added, speaker: &mut dyn Speaker) -> Option<ClientMessage> {
        let Added {
            category,
            value,
            id,
            announce_text,
            ..
        } = added;
        let list = &self.lists[category.index()];
        if list.iter().any(|e| e.id == Some(id)) {
            return None;
        }

        let key = EntryKey::new(category, value);
        if take_one(&mut self.pending, &key) {
            let cancelled = self.cancelled.get_mut(&key).and_then(VecDeque::pop_front);
            if self.cancelled.get(&key).is_some_and(VecDeque::is_empty) {
                self.cancelled.remove(&key);
            }
            match cancelled {
                Some(OnConfirm::RemoveById) => {
                    log::debug!("Removing {id} deleted before confirmation");
                    self.retracted.insert(id);
                    return Some(ClientMessage::EntryRemoved { category, id });
                }
                Some(OnConfirm::Drop) => return None,
                None => {}
            }

            let list = &mut self.lists[category.index()];
            if let Some(index) = list
                .iter()
                .position(|e| e.is_pending() && e.value == key.value)
            {
                list.remove(index);
            }
            insert_confirmed(list, key.value, id);
            return None;
        }

        insert_confirmed(&mut self.lists[category.index()], key.value.clone(), id);
        if self.link == LinkState::Live {
            self.announce(key, &announce_text, speaker);
        }
        None
    }

    fn apply_removed(&mut self, removed: Removed) {
        let list = &mut self.lists[removed.category.index()];
        if let Some(index) = list.iter().position(|e| e.id == Some(removed.id)) {
            list.remove(index);
            self.retracted.remove(&removed.id);
        } else if !self.retracted.remove(&removed.id) {
            log::debug!(
                "Removal of unknown {} in {} ignored",
                removed.id,
                removed.category
            );
        }
    }

    /// Replace the mirror with a snapshot, keeping local pending work.
    ///
    /// An entry the mirror has never seen whose key matches a pending add
    /// is that add's confirmation: it reached the server but its echo was
    /// lost with the connection.
    fn reset(&mut self, session: Uuid, seq: u64, state: &StoreSnapshot) -> Vec<ClientMessage> {
        let known: HashSet<EntryId> = self
            .lists
            .iter()
            .flatten()
            .filter_map(|e| e.id)
            .chain(self.retracted.iter().copied())
            .collect();

        let mut intents = Vec::new();
        let mut still_retracted = HashSet::new();
        for category in Category::ALL {
            let mut pending: Vec<MirrorEntry> = self.lists[category.index()]
                .drain(..)
                .filter(MirrorEntry::is_pending)
                .collect();

            let mut list = Vec::with_capacity(state.entries(category).len() + pending.len());
            for entry in state.entries(category) {
                if self.retracted.contains(&entry.id) {
                    still_retracted.insert(entry.id);
                    continue;
                }
                let key = EntryKey::new(category, entry.value.clone());
                if !known.contains(&entry.id) && take_one(&mut self.pending, &key) {
                    let cancelled = self.cancelled.get_mut(&key).and_then(VecDeque::pop_front);
                    if self.cancelled.get(&key).is_some_and(VecDeque::is_empty) {
                        self.cancelled.remove(&key);
                    }
                    if let Some(index) = pending.iter().position(|e| e.value == entry.value) {
                        pending.remove(index);
                    }
                    if cancelled == Some(OnConfirm::RemoveById) {
                        log::debug!("Removing {} deleted before confirmation", entry.id);
                        still_retracted.insert(entry.id);
                        intents.push(ClientMessage::EntryRemoved {
                            category,
                            id: entry.id,
                        });
                        continue;
                    }
                }
                self.announced.insert(key);
                list.push(MirrorEntry {
                    value: entry.value.clone(),
                    id: Some(entry.id),
                });
            }
            list.extend(pending);
            self.lists[category.index()] = list;
        }
        self.retracted = still_retracted;
        self.session = Some(session);
        self.last_seq = seq;
        self.link = LinkState::Live;
        log::info!(
            "Mirror reset from snapshot at seq {seq} ({} entries)",
            state.total_len()
        );
        intents
    }

    fn announce(&mut self, key: EntryKey, text: &str, speaker: &mut dyn Speaker) {
        if self.muted || self.announced.contains(&key) {
            return;
        }
        speaker.speak(text);
        self.announced.insert(key);
    }

    /// Transport dropped: silence events until the next greeting.
    pub fn connection_lost(&mut self) {
        self.link = LinkState::Syncing;
    }

    /// Token to present when reconnecting, once a session exists.
    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.session.map(|session| ResumeToken {
            session,
            offset: self.last_seq,
        })
    }

    pub fn entries(&self, category: Category) -> &[MirrorEntry] {
        &self.lists[category.index()]
    }

    pub fn values(&self, category: Category) -> Vec<&str> {
        self.lists[category.index()]
            .iter()
            .map(|e| e.value.as_str())
            .collect()
    }

    /// `(category, values)` for every category, in display order.
    pub fn columns(&self) -> Vec<(Category, Vec<&str>)> {
        Category::ALL
            .into_iter()
            .map(|c| (c, self.values(c)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn addressing(&self) -> DeleteAddressing {
        self.addressing
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().sum()
    }

    pub fn is_announced(&self, key: &EntryKey) -> bool {
        self.announced.contains(key)
    }
}

fn take_one(counts: &mut HashMap<EntryKey, usize>, key: &EntryKey) -> bool {
    match counts.get_mut(key) {
        Some(n) if *n > 1 => {
            *n -= 1;
            true
        }
        Some(_) => {
            counts.remove(key);
            true
        }
        None => false,
    }
}

/// Insert at the end of the confirmed prefix.
fn insert_confirmed(list: &mut Vec<MirrorEntry>, value: String, id: EntryId) {
    let at = list
        .iter()
        .position(MirrorEntry::is_pending)
        .unwrap_or(list.len());
    list.insert(at, MirrorEntry {
        value,
        id: Some(id),
    });
}
