//! Generic CRUD contract the engine persists through.

use async_trait::async_trait;

use crate::error::Result;

/// A persisted entity addressable by id and listable by filter.
pub trait Entity: Clone + Send + Sync + 'static {
    type Filter: Default + Send + Sync;

    /// Short name used in errors and table names.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn matches(&self, filter: &Self::Filter) -> bool;

    /// Entities sharing a dedup key cannot both be saved.
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

/// CRUD-by-id plus filtered listing.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<T>>;

    /// Matching entities in insertion order.
    async fn list(&self, filter: &T::Filter) -> Result<Vec<T>>;

    /// Insert. Fails with `Duplicate` on an id or dedup-key clash.
    async fn save(&self, entity: &T) -> Result<()>;

    /// Replace an existing entity. Fails if it does not exist.
    async fn update(&self, entity: &T) -> Result<()>;
}
