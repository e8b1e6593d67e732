//! Authoritative in-memory category store.
//!
//! ```text
//! ┌──────────────┬───────────────────────────┐
//! │ DRS          │ [ #1 "7" | #4 "9" ]        │
//! │ Override     │ [ ]                        │
//! │ Check Date   │ [ #2 "15" ]                │
//! └──────────────┴───────────────────────────┘
//!   position = index in the list (shifts on removal)
//!   id       = assigned once at add time (never reused)
//! ```
//!
//! The store itself does no locking. Each call is atomic with respect to
//! its own state; ordering across callers is the hub's job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::category::Category;

/// Stable identifier assigned to an entry when it is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single value filed under a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub value: String,
}

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Position outside the current list bounds (usually a drifted client view)
    IndexOutOfRange {
        category: Category,
        position: usize,
        len: usize,
    },
    /// No entry with this id in the category
    UnknownEntry { category: Category, id: EntryId },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange {
                category,
                position,
                len,
            } => write!(
                f,
                "Index out of range: position {position} in {category} (len {len})"
            ),
            Self::UnknownEntry { category, id } => {
                write!(f, "Unknown entry {id} in {category}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Full read-only copy of the store, sent in the handshake.
///
/// Every category is present, possibly with an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreSnapshot {
    pub lists: BTreeMap<Category, Vec<Entry>>,
}

impl StoreSnapshot {
    /// Snapshot with every category empty.
    pub fn empty() -> Self {
        Self {
            lists: Category::ALL.into_iter().map(|c| (c, Vec::new())).collect(),
        }
    }

    /// Entries of one category (empty if the sender left it out).
    pub fn entries(&self, category: Category) -> &[Entry] {
        self.lists.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values of one category, in order.
    pub fn values(&self, category: Category) -> Vec<&str> {
        self.entries(category).iter().map(|e| e.value.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.values().all(Vec::is_empty)
    }

    pub fn total_len(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }
}

/// The authoritative category -> ordered list mapping.
#[derive(Debug, Clone)]
pub struct CategoryStore {
    lists: [Vec<Entry>; 3],
    next_id: u64,
}

impl Default for CategoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            lists: [Vec::new(), Vec::new(), Vec::new()],
            next_id: 1,
        }
    }

    /// Append `value` to `category`.
    ///
    /// Returns the assigned id and the new position (the old length).
    pub fn add(&mut self, category: Category, value: impl Into<String>) -> (EntryId, usize) {
        let id = EntryId(self.next_id);
        self.next_id += 1;

        let list = &mut self.lists[category.index()];
        let position = list.len();
        list.push(Entry {
            id,
            value: value.into(),
        });
        (id, position)
    }

    /// Remove the entry at `position`, shifting later entries down by one.
    pub fn remove_at(&mut self, category: Category, position: usize) -> Result<Entry, StoreError> {
        let list = &mut self.lists[category.index()];
        if position >= list.len() {
            return Err(StoreError::IndexOutOfRange {
                category,
                position,
                len: list.len(),
            });
        }
        Ok(list.remove(position))
    }

    /// Remove the entry with `id`, wherever it currently sits.
    ///
    /// Returns the position it occupied at removal time.
    pub fn remove_by_id(
        &mut self,
        category: Category,
        id: EntryId,
    ) -> Result<(usize, Entry), StoreError> {
        let list = &mut self.lists[category.index()];
        let position = list
            .iter()
            .position(|e| e.id == id)
            .ok_or(StoreError::UnknownEntry { category, id })?;
        Ok((position, list.remove(position)))
    }

    /// Entry at `position`, if any.
    pub fn get(&self, category: Category, position: usize) -> Option<&Entry> {
        self.lists[category.index()].get(position)
    }

    pub fn entries(&self, category: Category) -> &[Entry] {
        &self.lists[category.index()]
    }

    pub fn len(&self, category: Category) -> usize {
        self.lists[category.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// Full copy for the handshake.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            lists: Category::ALL
                .into_iter()
                .map(|c| (c, self.lists[c.index()].clone()))
                .collect(),
        }
    }
}
