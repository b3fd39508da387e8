//! Document, key and guard types shared by every document store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A stored document.
///
/// Documents are JSON objects. The store never interprets them beyond
/// evaluating guards and predicates handed to it by the caller.
pub type Document = Value;

/// Server-side filter evaluated by the store against each document.
pub type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Primary key of a document within a collection.
///
/// Entity records use text keys; pool slots are keyed by the integer they
/// represent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key.
    Int(i64),
    /// String key.
    Text(String),
}

impl Key {
    /// Returns the integer value if this is an integer key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    /// Returns the string value if this is a text key.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Text(s) => Some(s),
        }
    }

    /// Returns the key as the JSON value stored in a document's `id` field.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(v) => Value::from(*v),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Key {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Field-equality guard for conditional replaces.
///
/// The replace only happens if the stored document's `field` equals
/// `expected`; otherwise the store fails with `GuardFailed`. A missing
/// field compares equal to `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    /// Field to compare.
    pub field: String,
    /// Value the field must currently hold.
    pub expected: Value,
}

impl Guard {
    /// Creates a guard requiring `field == expected`.
    pub fn field_eq(field: impl Into<String>, expected: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
        }
    }

    /// Returns true if `doc` satisfies the guard.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        doc.get(&self.field).unwrap_or(&Value::Null) == &self.expected
    }
}

/// What a bulk insert does when a key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Fail the whole batch with `AlreadyExists`; nothing is written.
    #[default]
    Error,
    /// Replace the existing document.
    Replace,
}
