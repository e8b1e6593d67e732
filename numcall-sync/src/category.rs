//! Categories, entry values and the idempotency key clients dedup on.
//!
//! The category set is closed: every dispatch over categories is an
//! exhaustive `match`, and a name outside the set can only appear at a
//! parsing boundary (wire frames, console input), where it is rejected
//! with [`InvalidCategory`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the fixed lists entries are filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Drs,
    Override,
    CheckDate,
}

impl Category {
    /// All categories in display order.
    pub const ALL: [Category; 3] = [Category::Drs, Category::Override, Category::CheckDate];

    /// Human-facing name, also used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Drs => "DRS",
            Category::Override => "Override",
            Category::CheckDate => "Check Date",
        }
    }

    /// Dense index into per-category arrays.
    pub fn index(&self) -> usize {
        match self {
            Category::Drs => 0,
            Category::Override => 1,
            Category::CheckDate => 2,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = InvalidCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| InvalidCategory(s.to_string()))
    }
}

impl TryFrom<String> for Category {
    type Error = InvalidCategory;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(category: Category) -> Self {
        category.name().to_string()
    }
}

/// A category name outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCategory(pub String);

impl fmt::Display for InvalidCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid category: {:?}", self.0)
    }
}

impl std::error::Error for InvalidCategory {}

/// Rejected entry value. Never leaves the client that typed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    NonDigit(char),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "value is empty"),
            Self::NonDigit(c) => write!(f, "value contains non-digit character {c:?}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Check that `value` is a non-empty run of ASCII decimal digits.
pub fn validate_value(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty);
    }
    match value.chars().find(|c| !c.is_ascii_digit()) {
        Some(c) => Err(ValidationError::NonDigit(c)),
        None => Ok(()),
    }
}

/// Default spoken text for an addition, e.g. `"DRS 7"`.
pub fn announce_text(category: Category, value: &str) -> String {
    format!("{} {}", category.name(), value)
}

/// Idempotency key: `(category, value)`.
///
/// Used to recognise the echo of a client's own optimistic add and to
/// suppress repeated speech for the same value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub category: Category,
    pub value: String,
}

impl EntryKey {
    pub fn new(category: Category, value: impl Into<String>) -> Self {
        Self {
            category,
            value: value.into(),
        }
    }
}
