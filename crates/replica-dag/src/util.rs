//! Integrity checks over a DAG read.

use replica_types::Hash;

use crate::error::{DagError, DagResult};
use crate::store::Read;
use crate::visitor::{walk, Visitor};

struct NoopVisitor;

impl Visitor for NoopVisitor {}

/// Fail with `ChunkNotFound` if any chunk reachable from `root` is missing.
pub async fn assert_no_missing_chunks<R: Read + ?Sized>(read: &R, root: &Hash) -> DagResult<()> {
    walk(read, root, &mut NoopVisitor).await
}

/// Fail with `ChunkNotFound` for the first hash that is not present.
pub async fn assert_all_present<'a, R, I>(read: &R, hashes: I) -> DagResult<()>
where
    R: Read + ?Sized,
    I: IntoIterator<Item = &'a Hash>,
{
    for hash in hashes {
        if !read.has_chunk(hash).await? {
            return Err(DagError::ChunkNotFound(hash.clone()));
        }
    }
    Ok(())
}

/// Fail with `UnexpectedChunk` for the first hash that is present.
pub async fn assert_none_present<'a, R, I>(read: &R, hashes: I) -> DagResult<()>
where
    R: Read + ?Sized,
    I: IntoIterator<Item = &'a Hash>,
{
    for hash in hashes {
        if read.has_chunk(hash).await? {
            return Err(DagError::UnexpectedChunk(hash.clone()));
        }
    }
    Ok(())
}
