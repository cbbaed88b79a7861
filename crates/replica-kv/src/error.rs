/// Errors from key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The transaction was already committed.
    #[error("transaction already committed")]
    AlreadyCommitted,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend specific failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for KV operations.
pub type KvResult<T> = Result<T, KvError>;
