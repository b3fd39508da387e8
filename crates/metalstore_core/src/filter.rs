//! Predicate filters evaluated by the backend.

use crate::entity::{EntityId, ID_FIELD};
use metalstore_storage::{Document, Predicate};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A document predicate passed through to the backend.
///
/// Several filters are combined with logical AND. A filter without a
/// predicate ([`Filter::pass`]) matches everything and is dropped before the
/// query reaches the backend.
#[derive(Clone, Default)]
pub struct Filter {
    predicate: Option<Predicate>,
}

impl Filter {
    /// A filter that matches everything.
    #[must_use]
    pub fn pass() -> Self {
        Self::default()
    }

    /// A filter from an arbitrary predicate.
    pub fn new(predicate: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Matches documents whose top-level `field` equals `value`.
    pub fn field_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        Self::new(move |doc| doc.get(&field) == Some(&value))
    }

    /// Matches documents whose id is one of `ids`.
    pub fn id_in(ids: impl IntoIterator<Item = EntityId>) -> Self {
        let ids: HashSet<String> = ids.into_iter().map(|id| id.as_str().to_string()).collect();
        Self::new(move |doc| {
            doc.get(ID_FIELD)
                .and_then(Value::as_str)
                .is_some_and(|id| ids.contains(id))
        })
    }

    /// Returns true if this filter matches everything.
    #[must_use]
    pub fn is_pass(&self) -> bool {
        self.predicate.is_none()
    }

    /// Evaluates the filter against a document.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(doc))
    }

    /// Folds filters into one backend predicate, or `None` when every filter
    /// is a pass.
    pub(crate) fn combine(filters: &[Filter]) -> Option<Predicate> {
        let mut active: Vec<Predicate> = filters
            .iter()
            .filter_map(|f| f.predicate.clone())
            .collect();
        match active.len() {
            0 => None,
            1 => active.pop(),
            _ => Some(Arc::new(move |doc: &Document| active.iter().all(|p| p(doc)))),
        }
    }
}

impl From<Option<Filter>> for Filter {
    fn from(filter: Option<Filter>) -> Self {
        filter.unwrap_or_default()
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("pass", &self.is_pass())
            .finish()
    }
}
