//! Versioned entities and their store.

mod id;
mod meta;
mod store;

pub use id::EntityId;
pub use meta::{Entity, Meta, CHANGED_FIELD, CREATED_FIELD, ID_FIELD};
pub use store::{EntityStore, CHANGED_BY_ANOTHER};
