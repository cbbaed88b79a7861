//! Error types for the chunk DAG.

use replica_kv::KvError;
use replica_types::{Hash, TypeError, Value};

/// Errors that can occur during DAG store operations.
///
/// Everything except [`DagError::ChunkNotFound`] indicates a programming
/// error or storage corruption and must abort the enclosing transaction.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// A chunk that is structurally required is missing.
    #[error("chunk not found: {0}")]
    ChunkNotFound(Hash),

    /// A chunk listed its own hash among its refs.
    #[error("chunk {0} references itself")]
    SelfReference(Hash),

    /// A persisted ref count is not an unsigned 16 bit integer.
    #[error("invalid ref count {value} for {hash}. We expect the value to be a Uint16")]
    InvalidRefCount {
        /// Chunk the count belongs to.
        hash: Hash,
        /// The offending stored value.
        value: Value,
    },

    /// Ref count bookkeeping went negative or otherwise broke its invariant.
    #[error("ref count invariant violated for {hash}: {count}")]
    RefCountInvariant {
        /// Chunk whose count is wrong.
        hash: Hash,
        /// The computed count.
        count: i64,
    },

    /// Stored chunk data or meta has the wrong shape.
    #[error("invalid chunk {hash}: {reason}")]
    InvalidChunk {
        /// The malformed chunk.
        hash: Hash,
        /// What was wrong with it.
        reason: String,
    },

    /// A temp hash was about to reach a store.
    #[error("temp hash {0} cannot be stored")]
    TempHashPersisted(Hash),

    /// A chunk was expected to be absent but is present.
    #[error("unexpected chunk present: {0}")]
    UnexpectedChunk(Hash),

    /// A stored string is not a valid hash.
    #[error(transparent)]
    InvalidHash(#[from] TypeError),

    /// Error from the backing key-value store.
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for DAG results.
pub type DagResult<T> = Result<T, DagError>;
