//! Versioned record metadata.

use crate::entity::EntityId;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Name of the document field holding the identifier.
pub const ID_FIELD: &str = "id";
/// Name of the document field holding the creation timestamp.
pub const CREATED_FIELD: &str = "created";
/// Name of the document field holding the optimistic-concurrency token.
pub const CHANGED_FIELD: &str = "changed";

/// Identifier and timestamps shared by every stored record.
///
/// Embed it in a record with `#[serde(flatten)]` so the three fields sit at
/// the top level of the stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique identifier; empty until assigned.
    #[serde(default)]
    pub id: EntityId,
    /// Set once on create.
    #[serde(default)]
    pub created: DateTime<Utc>,
    /// Refreshed on every successful write.
    #[serde(default)]
    pub changed: DateTime<Utc>,
}

impl Meta {
    /// Creates metadata with the given id and zero timestamps.
    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// A record the [`EntityStore`](crate::EntityStore) can persist.
///
/// # Example
///
/// ```rust
/// use metalstore_core::{Entity, Meta};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Machine {
///     #[serde(flatten)]
///     meta: Meta,
///     hostname: String,
/// }
///
/// impl Entity for Machine {
///     fn meta(&self) -> &Meta { &self.meta }
///     fn meta_mut(&mut self) -> &mut Meta { &mut self.meta }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    /// Returns the record's metadata.
    fn meta(&self) -> &Meta;

    /// Returns the record's metadata mutably.
    fn meta_mut(&mut self) -> &mut Meta;

    /// The identifier.
    fn id(&self) -> &EntityId {
        &self.meta().id
    }

    /// Sets the identifier.
    fn set_id(&mut self, id: EntityId) {
        self.meta_mut().id = id;
    }

    /// The creation timestamp.
    fn created(&self) -> DateTime<Utc> {
        self.meta().created
    }

    /// Sets the creation timestamp.
    fn set_created(&mut self, at: DateTime<Utc>) {
        self.meta_mut().created = at;
    }

    /// The last-changed timestamp.
    fn changed(&self) -> DateTime<Utc> {
        self.meta().changed
    }

    /// Sets the last-changed timestamp.
    fn set_changed(&mut self, at: DateTime<Utc>) {
        self.meta_mut().changed = at;
    }
}
