pub mod db;
pub mod domain;

pub use db::{
    CollectionPath, DocPath, Document, FieldUpdate, GroupQuery, MemoryStore, PartitionStore,
    PgStore, Snapshot, SnapshotStream, StoreError, Value, WriteMode,
};
