use std::sync::Arc;

use replica_types::{size_of_value, ChunkHasher, Hash, Value};

use crate::error::{DagError, DagResult};

/// Immutable unit of storage: a JSON value plus the hashes it references.
///
/// `meta` is the exhaustive list of hashes this chunk points at and is what
/// garbage collection follows. Cloning is cheap; the data and refs are
/// shared.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
    hash: Hash,
    data: Arc<Value>,
    meta: Arc<[Hash]>,
}

impl Chunk {
    /// Build a chunk with a known hash.
    ///
    /// Duplicate refs are collapsed (first occurrence wins). A ref equal to
    /// `hash` is rejected.
    pub fn new(hash: Hash, data: Value, refs: Vec<Hash>) -> DagResult<Self> {
        let mut meta: Vec<Hash> = Vec::with_capacity(refs.len());
        for r in refs {
            if r == hash {
                return Err(DagError::SelfReference(hash));
            }
            if !meta.contains(&r) {
                meta.push(r);
            }
        }
        Ok(Self {
            hash,
            data: Arc::new(data),
            meta: meta.into(),
        })
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Hashes referenced by this chunk.
    pub fn meta(&self) -> &[Hash] {
        &self.meta
    }

    pub(crate) fn shared_meta(&self) -> Arc<[Hash]> {
        Arc::clone(&self.meta)
    }

    /// Estimated size of the chunk data in bytes.
    pub fn size(&self) -> usize {
        size_of_value(&self.data)
    }
}

/// Create a chunk, assigning its hash with `hasher`.
pub fn create_chunk(data: Value, refs: Vec<Hash>, hasher: &ChunkHasher) -> DagResult<Chunk> {
    let bytes = serde_json::to_vec(&data)?;
    let hash = hasher(&bytes);
    Chunk::new(hash, data, refs)
}
