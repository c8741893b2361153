use thiserror::Error;

/// Errors surfaced by a [`PartitionStore`](super::PartitionStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The store refused an ordering it has no composite index for.
    ///
    /// The message is the store's own diagnostic and is meant to reach the
    /// operator unchanged.
    #[error("{0}")]
    IndexRequired(String),

    /// The query shape is not supported by the backend.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A path or stored body could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
