use meter_store::StoreError;

/// Failure categories reported by every service operation.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    /// Missing or unusable credentials, or a malformed workbook. Raised
    /// before any store operation.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The store's own diagnostic, passed through untouched.
    #[error("{0}")]
    IndexRequired(String),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
}

impl ServiceError {
    /// A caller-supplied id that can't form a document path.
    pub fn bad_id(e: StoreError) -> Self {
        ServiceError::InvalidArgument(e.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            StoreError::IndexRequired(msg) => ServiceError::IndexRequired(msg),
            other => ServiceError::Store(other),
        }
    }
}

impl From<csv::Error> for ServiceError {
    fn from(e: csv::Error) -> Self {
        ServiceError::Encode(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Encode(e.to_string())
    }
}
