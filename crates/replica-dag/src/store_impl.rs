//! DAG store mapped onto a transactional key-value store.
//!
//! Each chunk occupies up to three keys (data, meta, ref count) and each
//! head one key; see [`crate::key`]. Ref counts are persisted and updated
//! incrementally on every commit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use replica_kv::{KvRead, KvStore, KvWrite};
use replica_types::{ChunkHasher, Hash, Value};
use tracing::debug;

use crate::chunk::{create_chunk, Chunk};
use crate::error::{DagError, DagResult};
use crate::gc::{compute_ref_count_updates, HeadChange, RefCountUpdatesDelegate};
use crate::key::{chunk_data_key, chunk_meta_key, chunk_ref_count_key, head_key};
use crate::store::{assert_not_empty, assert_not_temp, Read, Store, Write};

/// Durable DAG store over any [`KvStore`].
pub struct StoreImpl {
    kv: Arc<dyn KvStore>,
    chunk_hasher: ChunkHasher,
}

impl StoreImpl {
    pub fn new(kv: Arc<dyn KvStore>, chunk_hasher: ChunkHasher) -> Self {
        Self { kv, chunk_hasher }
    }
}

impl std::fmt::Debug for StoreImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreImpl").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for StoreImpl {
    async fn read(&self) -> DagResult<Box<dyn Read>> {
        let tx = self.kv.read().await?;
        Ok(Box::new(ReadImpl { tx }))
    }

    async fn write(&self) -> DagResult<Box<dyn Write>> {
        let tx = self.kv.write().await?;
        Ok(Box::new(WriteImpl {
            tx,
            chunk_hasher: Arc::clone(&self.chunk_hasher),
            pending: Mutex::new(PendingChanges::default()),
        }))
    }

    async fn close(&self) -> DagResult<()> {
        self.kv.close().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared KV helpers
// ---------------------------------------------------------------------------

async fn read_chunk<R: KvRead + ?Sized>(tx: &R, hash: &Hash) -> DagResult<Option<Chunk>> {
    let Some(data) = tx.get(&chunk_data_key(hash)).await? else {
        return Ok(None);
    };
    let refs = read_refs(tx, hash).await?;
    Ok(Some(Chunk::new(hash.clone(), data, refs)?))
}

async fn read_refs<R: KvRead + ?Sized>(tx: &R, hash: &Hash) -> DagResult<Vec<Hash>> {
    match tx.get(&chunk_meta_key(hash)).await? {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(Hash::parse(&s)?),
                other => Err(DagError::InvalidChunk {
                    hash: hash.clone(),
                    reason: format!("meta entry is not a hash: {other}"),
                }),
            })
            .collect(),
        Some(other) => Err(DagError::InvalidChunk {
            hash: hash.clone(),
            reason: format!("meta is not an array: {other}"),
        }),
    }
}

async fn read_head<R: KvRead + ?Sized>(tx: &R, name: &str) -> DagResult<Option<Hash>> {
    match tx.get(&head_key(name)).await? {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(Hash::parse(&s)?)),
        Some(other) => Err(DagError::InvalidChunk {
            hash: Hash::empty(),
            reason: format!("head {name} is not a hash: {other}"),
        }),
    }
}

async fn read_ref_count<R: KvRead + ?Sized>(tx: &R, hash: &Hash) -> DagResult<Option<u32>> {
    let Some(value) = tx.get(&chunk_ref_count_key(hash)).await? else {
        return Ok(None);
    };
    match value.as_u64().and_then(|n| u16::try_from(n).ok()) {
        Some(n) => Ok(Some(u32::from(n))),
        None => Err(DagError::InvalidRefCount {
            hash: hash.clone(),
            value,
        }),
    }
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

struct ReadImpl {
    tx: Box<dyn KvRead>,
}

#[async_trait]
impl Read for ReadImpl {
    async fn has_chunk(&self, hash: &Hash) -> DagResult<bool> {
        Ok(self.tx.has(&chunk_data_key(hash)).await?)
    }

    async fn get_chunk(&self, hash: &Hash) -> DagResult<Option<Chunk>> {
        read_chunk(&*self.tx, hash).await
    }

    async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        read_head(&*self.tx, name).await
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingChanges {
    put_chunks: HashSet<Hash>,
    /// Keyed by head name; keeps the first `old` seen in this write.
    head_changes: HashMap<String, HeadChange>,
}

struct WriteImpl {
    tx: Box<dyn KvWrite>,
    chunk_hasher: ChunkHasher,
    pending: Mutex<PendingChanges>,
}

impl WriteImpl {
    fn pending(&self) -> MutexGuard<'_, PendingChanges> {
        self.pending.lock().expect("lock poisoned")
    }

    async fn set_head_internal(&self, name: &str, hash: Option<&Hash>) -> DagResult<()> {
        let old = read_head(&*self.tx, name).await?;
        match hash {
            Some(hash) => {
                assert_not_temp(hash)?;
                self.tx.put(&head_key(name), Value::String(hash.to_string())).await?;
            }
            None => self.tx.del(&head_key(name)).await?,
        }
        let mut pending = self.pending();
        pending
            .head_changes
            .entry(name.to_owned())
            .and_modify(|change| change.new = hash.cloned())
            .or_insert(HeadChange {
                old,
                new: hash.cloned(),
            });
        Ok(())
    }
}

#[async_trait]
impl Read for WriteImpl {
    async fn has_chunk(&self, hash: &Hash) -> DagResult<bool> {
        Ok(self.tx.has(&chunk_data_key(hash)).await?)
    }

    async fn get_chunk(&self, hash: &Hash) -> DagResult<Option<Chunk>> {
        read_chunk(&*self.tx, hash).await
    }

    async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        read_head(&*self.tx, name).await
    }
}

#[async_trait]
impl Write for WriteImpl {
    fn create_chunk(&self, data: Value, refs: Vec<Hash>) -> DagResult<Chunk> {
        create_chunk(data, refs, &self.chunk_hasher)
    }

    async fn put_chunk_sized(&self, chunk: Chunk, _size: Option<usize>) -> DagResult<()> {
        assert_not_temp(chunk.hash())?;
        assert_not_empty(chunk.hash())?;
        for r in chunk.meta() {
            assert_not_temp(r)?;
        }
        let hash = chunk.hash().clone();
        self.tx.put(&chunk_data_key(&hash), chunk.data().clone()).await?;
        if !chunk.meta().is_empty() {
            let meta = Value::Array(
                chunk
                    .meta()
                    .iter()
                    .map(|h| Value::String(h.to_string()))
                    .collect(),
            );
            self.tx.put(&chunk_meta_key(&hash), meta).await?;
        }
        self.pending().put_chunks.insert(hash);
        Ok(())
    }

    async fn set_head(&self, name: &str, hash: &Hash) -> DagResult<()> {
        self.set_head_internal(name, Some(hash)).await
    }

    async fn remove_head(&self, name: &str) -> DagResult<()> {
        self.set_head_internal(name, None).await
    }

    async fn commit(&self) -> DagResult<()> {
        let PendingChanges {
            put_chunks,
            head_changes,
        } = std::mem::take(&mut *self.pending());
        let head_changes: Vec<HeadChange> = head_changes.into_values().collect();

        let delegate = KvDelegate { tx: &*self.tx };
        let updates = compute_ref_count_updates(&head_changes, &put_chunks, &delegate).await?;

        let mut deleted = 0usize;
        for (hash, count) in &updates {
            if *count == 0 {
                self.tx.del(&chunk_data_key(hash)).await?;
                self.tx.del(&chunk_meta_key(hash)).await?;
                self.tx.del(&chunk_ref_count_key(hash)).await?;
                deleted += 1;
            } else {
                let count = u16::try_from(*count).map_err(|_| DagError::InvalidRefCount {
                    hash: hash.clone(),
                    value: Value::from(*count),
                })?;
                self.tx.put(&chunk_ref_count_key(hash), Value::from(count)).await?;
            }
        }
        debug!(updated = updates.len(), deleted, "committing dag write");
        self.tx.commit().await?;
        Ok(())
    }
}

struct KvDelegate<'a> {
    tx: &'a dyn KvWrite,
}

#[async_trait]
impl RefCountUpdatesDelegate for KvDelegate<'_> {
    async fn get_ref_count(&self, hash: &Hash) -> DagResult<Option<u32>> {
        read_ref_count(self.tx, hash).await
    }

    async fn get_refs(&self, hash: &Hash) -> DagResult<Option<Vec<Hash>>> {
        Ok(Some(read_refs(self.tx, hash).await?))
    }
}
