//! Error types for client records and the persist/refresh protocol.

use replica_dag::DagError;
use replica_db::{ClientId, DbError};

/// Errors that can occur while persisting, refreshing, or editing client
/// records.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Error from commit handling, B-trees, or rebase.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Error from the underlying DAG transaction.
    #[error(transparent)]
    Dag(#[from] DagError),

    /// The client's record is gone, usually collected after inactivity.
    /// Callers recover by starting over with a new client.
    #[error("Client state not found, id: {0}")]
    ClientStateNotFound(ClientId),

    /// A client group referenced by a client does not exist.
    #[error("client group not found: {0}")]
    ClientGroupNotFound(String),

    /// A client group update breaks a rule of client groups.
    #[error("invalid client group update: {0}")]
    InvalidClientGroupUpdate(String),

    /// The stored clients or client groups have the wrong shape.
    #[error("invalid client state: {0}")]
    InvalidClientState(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistError {
    /// Returns `true` if the client's record no longer exists.
    pub fn is_client_state_not_found(&self) -> bool {
        matches!(self, Self::ClientStateNotFound(_))
    }
}

impl From<replica_btree::BTreeError> for PersistError {
    fn from(err: replica_btree::BTreeError) -> Self {
        Self::Db(DbError::BTree(err))
    }
}

/// Convenience alias for persist results.
pub type PersistResult<T> = Result<T, PersistError>;
