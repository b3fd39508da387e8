//! Optimistic-concurrency entity store.

use crate::clock::Clock;
use crate::context::OpContext;
use crate::entity::{Entity, EntityId, CHANGED_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::filter::Filter;
use metalstore_storage::{Document, DocumentStore, Guard, Key};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Message carried by the conflict error of a lost update race.
pub const CHANGED_BY_ANOTHER: &str = "entity changed from another, please retry";

/// Typed CRUD over one collection, guarded by the `changed` timestamp.
///
/// The store holds no locks and no cached state. Every write is a single
/// atomic backend call; `update` is a compare-and-swap on the `changed`
/// field, so two writers starting from the same version can never both win.
///
/// # Example
///
/// ```rust,ignore
/// let machines: EntityStore<Machine> = EntityStore::open(backend, "machines", &ctx).await?;
///
/// let mut m = Machine::new("m-1");
/// machines.create(&ctx, &mut m).await?;
///
/// let mut edited = m.clone();
/// edited.hostname = "rack1-u12".into();
/// machines.update(&ctx, &mut edited, &m).await?;
/// ```
pub struct EntityStore<T> {
    backend: Arc<dyn DocumentStore>,
    collection: String,
    clock: &'static Clock,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Entity> EntityStore<T> {
    /// Opens the store, creating the collection if it does not exist.
    pub async fn open(
        backend: Arc<dyn DocumentStore>,
        collection: impl Into<String>,
        ctx: &OpContext,
    ) -> CoreResult<Self> {
        let collection = collection.into();
        ctx.run(backend.ensure_collection(&collection)).await?;
        tracing::debug!(collection = %collection, "opened entity store");
        Ok(Self {
            backend,
            collection,
            clock: Clock::global(),
            _marker: PhantomData,
        })
    }

    /// The collection this store manages.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Inserts a new record.
    ///
    /// Sets both timestamps to now and assigns a generated UUID when the
    /// record has no id yet. The caller's record is updated in place.
    ///
    /// # Errors
    ///
    /// `Conflict` if a record with the same id already exists.
    pub async fn create(&self, ctx: &OpContext, record: &mut T) -> CoreResult<()> {
        if record.id().is_empty() {
            record.set_id(EntityId::generate());
        }
        let now = self.clock.now();
        record.set_created(now);
        record.set_changed(now);

        let doc = encode(record)?;
        ctx.run(self.backend.insert(&self.collection, key(record.id()), doc))
            .await?;

        tracing::debug!(collection = %self.collection, id = %record.id(), "created entity");
        Ok(())
    }

    /// Reads a record by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if no record has this id.
    pub async fn get(&self, ctx: &OpContext, id: &EntityId) -> CoreResult<T> {
        let doc = ctx
            .run(self.backend.get(&self.collection, &key(id)))
            .await?
            .ok_or_else(|| {
                CoreError::not_found(format!("{} {} not found", self.collection, id))
            })?;
        decode(doc)
    }

    /// Returns true if a record with this id exists.
    pub async fn exists(&self, ctx: &OpContext, id: &EntityId) -> CoreResult<bool> {
        Ok(ctx
            .run(self.backend.get(&self.collection, &key(id)))
            .await?
            .is_some())
    }

    /// Replaces `old` with `new` if nobody else has written since `old` was
    /// read.
    ///
    /// On success `new` carries `old`'s created timestamp and a fresh changed
    /// timestamp. On failure `new` is left as it was passed in.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if the ids differ or are empty
    /// - `NotFound` if the record no longer exists
    /// - `Conflict` if the stored changed timestamp differs from `old`'s
    pub async fn update(&self, ctx: &OpContext, new: &mut T, old: &T) -> CoreResult<()> {
        if old.id().is_empty() {
            return Err(CoreError::invalid_argument("update requires an id"));
        }
        if new.id() != old.id() {
            return Err(CoreError::invalid_argument(format!(
                "update cannot change id from {} to {}",
                old.id(),
                new.id()
            )));
        }

        let guard = Guard::field_eq(CHANGED_FIELD, serde_json::to_value(old.changed())?);
        let (prev_created, prev_changed) = (new.created(), new.changed());
        new.set_created(old.created());
        new.set_changed(self.clock.now());

        let result = match encode(new) {
            Ok(doc) => {
                ctx.run(
                    self.backend
                        .replace_if(&self.collection, &key(old.id()), doc, &guard),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                tracing::debug!(collection = %self.collection, id = %new.id(), "updated entity");
                Ok(())
            }
            Err(e) => {
                new.set_created(prev_created);
                new.set_changed(prev_changed);
                if e.is_conflict() {
                    tracing::debug!(
                        collection = %self.collection,
                        id = %old.id(),
                        "update lost optimistic concurrency race"
                    );
                    return Err(CoreError::conflict(CHANGED_BY_ANOTHER));
                }
                Err(e)
            }
        }
    }

    /// Inserts or fully replaces a record. Last writer wins.
    ///
    /// The created timestamp of an existing record is kept; a new record gets
    /// now. The changed timestamp is always refreshed.
    pub async fn upsert(&self, ctx: &OpContext, record: &mut T) -> CoreResult<()> {
        if record.id().is_empty() {
            record.set_id(EntityId::generate());
        }
        let existing = ctx
            .run(self.backend.get(&self.collection, &key(record.id())))
            .await?;
        let now = self.clock.now();
        match existing {
            Some(doc) => record.set_created(decode::<T>(doc)?.created()),
            None => record.set_created(now),
        }
        record.set_changed(now);

        let doc = encode(record)?;
        ctx.run(self.backend.upsert(&self.collection, key(record.id()), doc))
            .await?;
        tracing::debug!(collection = %self.collection, id = %record.id(), "upserted entity");
        Ok(())
    }

    /// Deletes a record. Deleting a missing record is not an error.
    pub async fn delete(&self, ctx: &OpContext, record: &T) -> CoreResult<()> {
        self.delete_by_id(ctx, record.id()).await
    }

    /// Deletes a record by id. Deleting a missing id is not an error.
    pub async fn delete_by_id(&self, ctx: &OpContext, id: &EntityId) -> CoreResult<()> {
        let removed = ctx
            .run(self.backend.delete(&self.collection, &key(id)))
            .await?;
        tracing::debug!(
            collection = %self.collection,
            id = %id,
            existed = removed.is_some(),
            "deleted entity"
        );
        Ok(())
    }

    /// Returns the single record matching every filter.
    ///
    /// # Errors
    ///
    /// - `NotFound` if nothing matches
    /// - [`CoreError::MoreThanOne`] if two or more records match
    pub async fn find(&self, ctx: &OpContext, filters: &[Filter]) -> CoreResult<T> {
        let mut matches = ctx
            .run(
                self.backend
                    .query(&self.collection, Filter::combine(filters), Some(2)),
            )
            .await?;

        match matches.len() {
            0 => Err(CoreError::not_found(format!(
                "no matching entity in {}",
                self.collection
            ))),
            1 => {
                let (_, doc) = matches.remove(0);
                decode(doc)
            }
            _ => Err(CoreError::MoreThanOne {
                collection: self.collection.clone(),
            }),
        }
    }

    /// Returns every record matching all filters, in id order.
    pub async fn list(&self, ctx: &OpContext, filters: &[Filter]) -> CoreResult<Vec<T>> {
        ctx.run(
            self.backend
                .query(&self.collection, Filter::combine(filters), None),
        )
        .await?
        .into_iter()
        .map(|(_, doc)| decode(doc))
        .collect()
    }

    /// Counts records matching all filters.
    pub async fn count(&self, ctx: &OpContext, filters: &[Filter]) -> CoreResult<usize> {
        match Filter::combine(filters) {
            None => ctx.run(self.backend.count(&self.collection)).await,
            Some(predicate) => Ok(ctx
                .run(self.backend.query(&self.collection, Some(predicate), None))
                .await?
                .len()),
        }
    }
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            collection: self.collection.clone(),
            clock: self.clock,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for EntityStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

fn key(id: &EntityId) -> Key {
    Key::from(id)
}

fn encode<T: Entity>(record: &T) -> CoreResult<Document> {
    let doc = serde_json::to_value(record)?;
    if !doc.is_object() {
        return Err(CoreError::codec("entity must serialize to a JSON object"));
    }
    Ok(doc)
}

fn decode<T: Entity>(doc: Document) -> CoreResult<T> {
    Ok(serde_json::from_value(doc)?)
}
