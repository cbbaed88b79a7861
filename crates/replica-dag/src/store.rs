use async_trait::async_trait;
use replica_types::{Hash, Value};

use crate::chunk::Chunk;
use crate::error::{DagError, DagResult};

/// Transactional store of chunks plus a small set of named heads.
///
/// All implementations must satisfy these invariants:
/// - Any number of [`Read`]s may be open concurrently, but a [`Write`]
///   excludes every other transaction until it is dropped.
/// - A `Read` never observes a partially committed `Write`.
/// - Chunks unreachable from every head after a `commit` are deleted.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a read transaction. It holds its lock until dropped.
    async fn read(&self) -> DagResult<Box<dyn Read>>;

    /// Open a write transaction. It holds its lock until dropped; changes
    /// are discarded unless [`Write::commit`] is called.
    async fn write(&self) -> DagResult<Box<dyn Write>>;

    /// Close the store.
    async fn close(&self) -> DagResult<()>;
}

/// Read side of a DAG transaction.
#[async_trait]
pub trait Read: Send + Sync {
    /// Check whether a chunk exists.
    async fn has_chunk(&self, hash: &Hash) -> DagResult<bool>;

    /// Load a chunk. Returns `Ok(None)` if it is legitimately absent.
    async fn get_chunk(&self, hash: &Hash) -> DagResult<Option<Chunk>>;

    /// Load a chunk that must exist.
    ///
    /// Fails with [`DagError::ChunkNotFound`] if it does not.
    async fn must_get_chunk(&self, hash: &Hash) -> DagResult<Chunk> {
        self.get_chunk(hash)
            .await?
            .ok_or_else(|| DagError::ChunkNotFound(hash.clone()))
    }

    /// The hash a head points to, if the head exists.
    async fn get_head(&self, name: &str) -> DagResult<Option<Hash>>;
}

/// Write side of a DAG transaction.
///
/// Reads through a write observe its own pending changes.
#[async_trait]
pub trait Write: Read {
    /// Create a chunk hashed with the store's hasher. Does not stage it.
    fn create_chunk(&self, data: Value, refs: Vec<Hash>) -> DagResult<Chunk>;

    /// Stage a chunk for this write.
    async fn put_chunk(&self, chunk: Chunk) -> DagResult<()> {
        self.put_chunk_sized(chunk, None).await
    }

    /// Stage a chunk whose size is already known to the caller. Stores that
    /// do not account for sizes ignore `size`.
    async fn put_chunk_sized(&self, chunk: Chunk, size: Option<usize>) -> DagResult<()>;

    /// Point `name` at `hash`.
    async fn set_head(&self, name: &str, hash: &Hash) -> DagResult<()>;

    /// Remove the head `name`.
    async fn remove_head(&self, name: &str) -> DagResult<()>;

    /// Apply ref counting and garbage collection, then make all changes
    /// durable atomically.
    ///
    /// The store's write lock is held until the write is dropped, not until
    /// `commit` returns. Drop a committed write before opening another
    /// transaction on the same store from the same task.
    async fn commit(&self) -> DagResult<()>;
}

/// Reject temp hashes before they reach a store.
pub(crate) fn assert_not_temp(hash: &Hash) -> DagResult<()> {
    if hash.is_temp() {
        return Err(DagError::TempHashPersisted(hash.clone()));
    }
    Ok(())
}

/// Reject chunks stored under the empty hash, which always stands for the
/// empty tree and is never loaded.
pub(crate) fn assert_not_empty(hash: &Hash) -> DagResult<()> {
    if hash.is_empty() {
        return Err(DagError::InvalidChunk {
            hash: hash.clone(),
            reason: "the empty hash is reserved".into(),
        });
    }
    Ok(())
}
