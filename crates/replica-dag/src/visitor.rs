//! Depth-first traversal of the chunk graph.

use std::collections::HashSet;

use async_trait::async_trait;
use replica_types::Hash;

use crate::chunk::Chunk;
use crate::error::DagResult;
use crate::store::Read;

/// Hooks driven by [`walk`].
///
/// A visitor decides which hashes to descend into, observes every loaded
/// chunk, and may reorder or filter the children of a chunk.
#[async_trait]
pub trait Visitor: Send {
    /// Called before a hash is loaded. Returning `false` skips the hash and
    /// everything only reachable through it.
    async fn should_visit(&mut self, _hash: &Hash) -> DagResult<bool> {
        Ok(true)
    }

    /// Called once per visited chunk, before its children.
    async fn visit_chunk(&mut self, _chunk: &Chunk) -> DagResult<()> {
        Ok(())
    }

    /// Hashes to descend into after `chunk`, in visit order.
    fn children(&self, chunk: &Chunk) -> Vec<Hash> {
        chunk.meta().to_vec()
    }
}

/// Walk the graph under `root` in preorder, visiting every hash at most once.
///
/// The empty hash is never loaded. Every other visited hash must exist, or
/// the walk fails with `ChunkNotFound`.
pub async fn walk<R, V>(read: &R, root: &Hash, visitor: &mut V) -> DagResult<()>
where
    R: Read + ?Sized,
    V: Visitor + ?Sized,
{
    let mut seen: HashSet<Hash> = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(hash) = stack.pop() {
        if hash.is_empty() || !seen.insert(hash.clone()) {
            continue;
        }
        if !visitor.should_visit(&hash).await? {
            continue;
        }
        let chunk = read.must_get_chunk(&hash).await?;
        visitor.visit_chunk(&chunk).await?;
        let children = visitor.children(&chunk);
        stack.extend(children.into_iter().rev());
    }
    Ok(())
}
