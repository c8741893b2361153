pub mod document;
pub mod error;
pub mod memory;
pub mod path;
pub mod postgres;
pub mod query;

use futures::stream::BoxStream;

pub use document::{Document, FieldAccess, Value};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use path::{CollectionPath, DocPath};
pub use postgres::PgStore;
pub use query::{FieldUpdate, Filter, FilterOp, GroupQuery, Snapshot};

/// Lazily produced query results. Dropping the stream releases the
/// underlying cursor.
pub type SnapshotStream<'a> = BoxStream<'a, Result<Snapshot, StoreError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole document.
    Replace,
    /// Create the document or deep-merge the given fields into it.
    Merge,
}

/// Hierarchical document store addressed as collection/document paths.
///
/// Every method is a single round trip; nothing is retried.
#[async_trait::async_trait]
pub trait PartitionStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    async fn set(&self, path: &DocPath, doc: Document, mode: WriteMode) -> Result<(), StoreError>;

    /// Inserts a document under a generated id and returns its path.
    async fn add(&self, collection: &CollectionPath, doc: Document) -> Result<DocPath, StoreError>;

    /// Applies all updates to an existing document as one atomic write.
    ///
    /// Fails with [`StoreError::NotFound`] when the document is absent.
    async fn update(&self, path: &DocPath, updates: &[FieldUpdate]) -> Result<(), StoreError>;

    /// Deleting an absent document succeeds.
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Documents directly under `collection`, in path order.
    fn list(&self, collection: &CollectionPath) -> SnapshotStream<'_>;

    fn query(&self, query: GroupQuery) -> SnapshotStream<'_>;

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
