//! Error types for commits and DB writes.

use replica_btree::BTreeError;
use replica_dag::DagError;
use replica_types::{Hash, Value};

/// Errors that can occur while reading commits or writing through a
/// [`Write`](crate::Write).
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Error from the underlying DAG transaction.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Error from a B-tree read or edit.
    #[error(transparent)]
    BTree(#[from] BTreeError),

    /// A non-snapshot commit has no basis, so its chain is broken.
    #[error("commit {0} has no basis")]
    NoBasis(Hash),

    /// A stored commit chunk does not have the commit shape.
    #[error("invalid commit {hash}: {reason}")]
    InvalidCommit {
        /// Hash of the malformed commit.
        hash: Hash,
        /// What was wrong with it.
        reason: String,
    },

    /// A named head does not exist.
    #[error("missing head {0}")]
    MissingHead(String),

    /// A rebased mutation does not follow its new basis.
    #[error("inconsistent mutation id: original {actual}, next {expected}")]
    MutationIdMismatch {
        /// The id the new basis expects next.
        expected: u64,
        /// The id recorded on the mutation.
        actual: u64,
    },

    /// Two cookies of different kinds cannot be ordered.
    #[error("cannot compare cookies {a} and {b}")]
    CookieMismatch {
        /// Left-hand cookie.
        a: Value,
        /// Right-hand cookie.
        b: Value,
    },

    /// The operation is not allowed on this kind of write.
    #[error("not allowed: {0}")]
    NotAllowed(&'static str),

    /// A value could not be projected into a secondary index.
    #[error("cannot index {key}: {reason}")]
    IndexValue {
        /// Primary key of the value.
        key: String,
        /// Why it could not be indexed.
        reason: String,
    },

    /// A mutator failed while running.
    #[error("mutator {name} failed: {reason}")]
    Mutator {
        /// Name of the mutator.
        name: String,
        /// The failure it reported.
        reason: String,
    },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Returns `true` if a required chunk was missing from the DAG.
    pub fn is_chunk_not_found(&self) -> bool {
        match self {
            Self::Dag(DagError::ChunkNotFound(_)) => true,
            Self::BTree(err) => err.is_chunk_not_found(),
            _ => false,
        }
    }
}

/// Convenience alias for DB results.
pub type DbResult<T> = Result<T, DbError>;
