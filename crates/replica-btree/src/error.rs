//! Error types for the B-tree.

use replica_dag::DagError;
use replica_types::Hash;

/// Errors that can occur while reading or editing a B-tree.
#[derive(Debug, thiserror::Error)]
pub enum BTreeError {
    /// Error from the underlying DAG transaction.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// A stored node chunk does not have the node shape.
    #[error("invalid b-tree node {hash}: {reason}")]
    InvalidNode {
        /// Hash of the malformed node.
        hash: Hash,
        /// What was wrong with it.
        reason: String,
    },

    /// Node size bounds are unusable.
    #[error("invalid b-tree config: {0}")]
    InvalidConfig(String),
}

impl BTreeError {
    /// Returns `true` if a required chunk was missing from the DAG.
    pub fn is_chunk_not_found(&self) -> bool {
        matches!(self, Self::Dag(DagError::ChunkNotFound(_)))
    }
}

/// Convenience alias for B-tree results.
pub type BTreeResult<T> = Result<T, BTreeError>;
