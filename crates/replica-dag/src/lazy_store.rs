//! A caching DAG store in front of a slower source store.
//!
//! [`LazyStore`] keeps its heads in memory only. Chunks created through its
//! writes are "memory-only": they are never evicted and are dropped as soon
//! as they become unreachable from the heads. Chunks read from the source
//! store go into a byte-budgeted LRU cache. Writes never touch the source
//! store; the persist process copies memory-only chunks there and then calls
//! [`LazyStore::chunks_persisted`].
//!
//! Ref counts track reachability from the heads through every chunk whose
//! refs have been discovered so far. Refs are discovered lazily, when a chunk
//! is first cached or committed.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use replica_types::{ChunkHasher, Hash, Value};
use tokio::sync::{OnceCell, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::chunk::{create_chunk, Chunk};
use crate::chunks_cache::{default_chunk_sizer, ChunkSizer, ChunksCache};
use crate::config::LazyStoreConfig;
use crate::error::DagResult;
use crate::gc::{compute_ref_count_updates, HeadChange, RefCountUpdatesDelegate};
use crate::store::{assert_not_empty, assert_not_temp, Read, Store, Write};

struct LazyState {
    heads: HashMap<String, Hash>,
    mem_only: HashMap<Hash, Chunk>,
    cache: ChunksCache,
}

/// Lazily loading, caching [`Store`] over a source store.
pub struct LazyStore {
    /// Isolation between transactions: many reads or one write.
    lock: Arc<RwLock<()>>,
    state: Arc<Mutex<LazyState>>,
    source: Arc<dyn Store>,
    chunk_hasher: ChunkHasher,
}

impl LazyStore {
    /// Create a store over `source`, sizing cached chunks with
    /// [`Chunk::size`].
    pub fn new(
        source: Arc<dyn Store>,
        config: &LazyStoreConfig,
        chunk_hasher: ChunkHasher,
    ) -> Self {
        Self::with_chunk_sizer(source, config, chunk_hasher, default_chunk_sizer())
    }

    /// Create a store that measures cached chunks with `sizer`.
    pub fn with_chunk_sizer(
        source: Arc<dyn Store>,
        config: &LazyStoreConfig,
        chunk_hasher: ChunkHasher,
        sizer: ChunkSizer,
    ) -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            state: Arc::new(Mutex::new(LazyState {
                heads: HashMap::new(),
                mem_only: HashMap::new(),
                cache: ChunksCache::new(config.source_cache_size_limit, sizer),
            })),
            source,
            chunk_hasher,
        }
    }

    fn state(&self) -> MutexGuard<'_, LazyState> {
        self.state.lock().expect("lock poisoned")
    }

    /// The store chunks are lazily read from.
    pub fn source(&self) -> &Arc<dyn Store> {
        &self.source
    }

    /// Open a read transaction with access to lazy-store specific queries.
    pub async fn lazy_read(&self) -> LazyRead {
        let guard = Arc::clone(&self.lock).read_owned().await;
        LazyRead {
            _guard: guard,
            state: Arc::clone(&self.state),
            source: Arc::clone(&self.source),
            source_read: OnceCell::new(),
        }
    }

    /// Open a write transaction with access to lazy-store specific queries.
    pub async fn lazy_write(&self) -> LazyWrite {
        let guard = Arc::clone(&self.lock).write_owned().await;
        LazyWrite {
            _guard: guard,
            state: Arc::clone(&self.state),
            source: Arc::clone(&self.source),
            source_read: OnceCell::new(),
            chunk_hasher: Arc::clone(&self.chunk_hasher),
            pending: Mutex::new(PendingWrite::default()),
        }
    }

    /// Whether `hash` is in the source cache. Takes no transaction lock and
    /// does not change the LRU order.
    pub fn is_cached(&self, hash: &Hash) -> bool {
        self.state().cache.peek(hash).is_some()
    }

    /// Total size of the chunks in the source cache.
    pub fn cache_size(&self) -> usize {
        self.state().cache.size()
    }

    /// Mark memory-only chunks as durable in the source store. They move
    /// into the source cache and become evictable. Ref counts are unchanged.
    ///
    /// Takes the write lock.
    pub async fn chunks_persisted(&self, hashes: &[Hash]) {
        let _guard = self.lock.write().await;
        let mut guard = self.state();
        let state = &mut *guard;
        let chunks: Vec<Chunk> = hashes
            .iter()
            .filter_map(|hash| state.mem_only.remove(hash))
            .collect();
        debug!(persisted = chunks.len(), "moving persisted chunks into source cache");
        state.cache.persisted(chunks);
    }

    /// Run `fut` with source cache evictions and deletions deferred until it
    /// completes (or is dropped). Suspensions nest.
    pub async fn with_suspended_source_cache_evicts_and_deletes<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.state().cache.suspend();
        let _resume = ResumeOnDrop(&self.state);
        fut.await
    }
}

struct ResumeOnDrop<'a>(&'a Mutex<LazyState>);

impl Drop for ResumeOnDrop<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.cache.resume();
        }
    }
}

impl std::fmt::Debug for LazyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyStore")
            .field("cache_size", &self.cache_size())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for LazyStore {
    async fn read(&self) -> DagResult<Box<dyn Read>> {
        Ok(Box::new(self.lazy_read().await))
    }

    async fn write(&self) -> DagResult<Box<dyn Write>> {
        Ok(Box::new(self.lazy_write().await))
    }

    async fn close(&self) -> DagResult<()> {
        Ok(())
    }
}

async fn open_source<'a>(
    cell: &'a OnceCell<Box<dyn Read>>,
    source: &Arc<dyn Store>,
) -> DagResult<&'a dyn Read> {
    let read = cell.get_or_try_init(|| source.read()).await?;
    Ok(&**read)
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Read transaction of a [`LazyStore`]. Holds the read lock until dropped.
pub struct LazyRead {
    _guard: OwnedRwLockReadGuard<()>,
    state: Arc<Mutex<LazyState>>,
    source: Arc<dyn Store>,
    source_read: OnceCell<Box<dyn Read>>,
}

impl LazyRead {
    fn state(&self) -> MutexGuard<'_, LazyState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Whether `hash` is a memory-only chunk.
    pub fn is_mem_only_chunk_hash(&self, hash: &Hash) -> bool {
        self.state().mem_only.contains_key(hash)
    }
}

#[async_trait]
impl Read for LazyRead {
    async fn has_chunk(&self, hash: &Hash) -> DagResult<bool> {
        Ok(self.get_chunk(hash).await?.is_some())
    }

    async fn get_chunk(&self, hash: &Hash) -> DagResult<Option<Chunk>> {
        {
            let mut state = self.state();
            if let Some(chunk) = state.mem_only.get(hash) {
                return Ok(Some(chunk.clone()));
            }
            if let Some(chunk) = state.cache.get(hash) {
                return Ok(Some(chunk));
            }
        }
        let chunk = open_source(&self.source_read, &self.source)
            .await?
            .get_chunk(hash)
            .await?;
        if let Some(chunk) = &chunk {
            self.state().cache.put(chunk.clone());
        }
        Ok(chunk)
    }

    async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        Ok(self.state().heads.get(name).cloned())
    }
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PendingWrite {
    mem_only: HashMap<Hash, Chunk>,
    /// Source chunks put or read through this write, with an optional
    /// caller-supplied size.
    cached: HashMap<Hash, (Chunk, Option<usize>)>,
    head_changes: HashMap<String, HeadChange>,
    created: HashSet<Hash>,
}

/// Write transaction of a [`LazyStore`]. Holds the write lock until dropped.
///
/// A source chunk that misses the cache is treated as put by this write, so
/// that its reachability is decided at commit time.
pub struct LazyWrite {
    _guard: OwnedRwLockWriteGuard<()>,
    state: Arc<Mutex<LazyState>>,
    source: Arc<dyn Store>,
    source_read: OnceCell<Box<dyn Read>>,
    chunk_hasher: ChunkHasher,
    pending: Mutex<PendingWrite>,
}

impl LazyWrite {
    // Lock order: `pending` before `state`.

    fn pending(&self) -> MutexGuard<'_, PendingWrite> {
        self.pending.lock().expect("lock poisoned")
    }

    fn state(&self) -> MutexGuard<'_, LazyState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Whether `hash` is memory-only, counting chunks staged by this write.
    pub fn is_mem_only_chunk_hash(&self, hash: &Hash) -> bool {
        let pending = self.pending();
        pending.mem_only.contains_key(hash) || self.state().mem_only.contains_key(hash)
    }

    async fn set_head_internal(&self, name: &str, hash: Option<&Hash>) -> DagResult<()> {
        if let Some(hash) = hash {
            assert_not_temp(hash)?;
        }
        let old = self.get_head(name).await?;
        self.pending()
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
impl Read for LazyWrite {
    async fn has_chunk(&self, hash: &Hash) -> DagResult<bool> {
        Ok(self.get_chunk(hash).await?.is_some())
    }

    async fn get_chunk(&self, hash: &Hash) -> DagResult<Option<Chunk>> {
        {
            let pending = self.pending();
            if let Some(chunk) = pending.mem_only.get(hash) {
                return Ok(Some(chunk.clone()));
            }
            let mut state = self.state();
            if let Some(chunk) = state.mem_only.get(hash) {
                return Ok(Some(chunk.clone()));
            }
            if let Some((chunk, _)) = pending.cached.get(hash) {
                return Ok(Some(chunk.clone()));
            }
            if let Some(chunk) = state.cache.get(hash) {
                return Ok(Some(chunk));
            }
        }
        let chunk = open_source(&self.source_read, &self.source)
            .await?
            .get_chunk(hash)
            .await?;
        if let Some(chunk) = &chunk {
            self.pending()
                .cached
                .insert(hash.clone(), (chunk.clone(), None));
        }
        Ok(chunk)
    }

    async fn get_head(&self, name: &str) -> DagResult<Option<Hash>> {
        if let Some(change) = self.pending().head_changes.get(name) {
            return Ok(change.new.clone());
        }
        Ok(self.state().heads.get(name).cloned())
    }
}

#[async_trait]
impl Write for LazyWrite {
    fn create_chunk(&self, data: Value, refs: Vec<Hash>) -> DagResult<Chunk> {
        let chunk = create_chunk(data, refs, &self.chunk_hasher)?;
        self.pending().created.insert(chunk.hash().clone());
        Ok(chunk)
    }

    async fn put_chunk_sized(&self, chunk: Chunk, size: Option<usize>) -> DagResult<()> {
        assert_not_temp(chunk.hash())?;
        assert_not_empty(chunk.hash())?;
        for r in chunk.meta() {
            assert_not_temp(r)?;
        }
        let hash = chunk.hash().clone();
        let mut pending = self.pending();
        let mem_only = pending.created.contains(&hash)
            || pending.mem_only.contains_key(&hash)
            || self.state().mem_only.contains_key(&hash);
        if mem_only {
            pending.mem_only.insert(hash, chunk);
        } else {
            pending.cached.insert(hash, (chunk, size));
        }
        Ok(())
    }

    async fn set_head(&self, name: &str, hash: &Hash) -> DagResult<()> {
        self.set_head_internal(name, Some(hash)).await
    }

    async fn remove_head(&self, name: &str) -> DagResult<()> {
        self.set_head_internal(name, None).await
    }

    async fn commit(&self) -> DagResult<()> {
        let pending = std::mem::take(&mut *self.pending());
        let put_chunks: HashSet<Hash> = pending
            .mem_only
            .keys()
            .chain(pending.cached.keys())
            .cloned()
            .collect();
        let head_changes: Vec<HeadChange> = pending.head_changes.values().cloned().collect();

        let delegate = CommitDelegate {
            pending: &pending,
            state: &self.state,
        };
        let mut updates = compute_ref_count_updates(&head_changes, &put_chunks, &delegate).await?;

        let mut guard = self.state();
        let state = &mut *guard;
        let mem_only: Vec<Hash> = updates
            .keys()
            .filter(|h| pending.mem_only.contains_key(*h) || state.mem_only.contains_key(*h))
            .cloned()
            .collect();
        let mut deleted = 0usize;
        for hash in mem_only {
            let Some(count) = updates.remove(&hash) else {
                continue;
            };
            if count == 0 {
                state.cache.ref_counts.remove(&hash);
                state.cache.refs.remove(&hash);
                state.mem_only.remove(&hash);
                deleted += 1;
            } else {
                state.cache.ref_counts.insert(hash.clone(), count);
                if let Some(chunk) = pending.mem_only.get(&hash) {
                    state.cache.refs.insert(hash.clone(), chunk.shared_meta());
                    state.mem_only.insert(hash, chunk.clone());
                }
            }
        }
        state.cache.update_for_commit(&pending.cached, updates);

        for (name, change) in pending.head_changes {
            match change.new {
                Some(hash) => {
                    state.heads.insert(name, hash);
                }
                None => {
                    state.heads.remove(&name);
                }
            }
        }
        debug!(
            mem_only = state.mem_only.len(),
            deleted,
            cache_size = state.cache.size(),
            "committed lazy store write"
        );
        Ok(())
    }
}

struct CommitDelegate<'a> {
    pending: &'a PendingWrite,
    state: &'a Mutex<LazyState>,
}

impl CommitDelegate<'_> {
    fn state(&self) -> MutexGuard<'_, LazyState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl RefCountUpdatesDelegate for CommitDelegate<'_> {
    async fn get_ref_count(&self, hash: &Hash) -> DagResult<Option<u32>> {
        Ok(self.state().cache.ref_counts.get(hash).copied())
    }

    async fn get_refs(&self, hash: &Hash) -> DagResult<Option<Vec<Hash>>> {
        if let Some(chunk) = self.pending.mem_only.get(hash) {
            return Ok(Some(chunk.meta().to_vec()));
        }
        let state = self.state();
        if let Some(chunk) = state.mem_only.get(hash) {
            return Ok(Some(chunk.meta().to_vec()));
        }
        if let Some((chunk, _)) = self.pending.cached.get(hash) {
            return Ok(Some(chunk.meta().to_vec()));
        }
        Ok(state.cache.refs.get(hash).map(|refs| refs.to_vec()))
    }

    fn is_lazy(&self) -> bool {
        true
    }

    fn are_refs_counted(&self, hash: &Hash) -> bool {
        self.state().cache.refs.contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::DagError;
    use crate::store_impl::StoreImpl;
    use replica_kv::MemKvStore;
    use replica_types::fake_hasher;
    use serde_json::json;

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn source_store() -> Arc<dyn Store> {
        Arc::new(StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("5")))
    }

    fn lazy(source: &Arc<dyn Store>, limit: usize) -> LazyStore {
        LazyStore::with_chunk_sizer(
            Arc::clone(source),
            &LazyStoreConfig::with_limit(limit),
            fake_hasher("1a2"),
            Arc::new(|_: &Chunk| 10),
        )
    }

    /// Writes `root -> [a, b]` to `source` under head `src` and returns
    /// `[root, a, b]`.
    async fn seed_source(source: &Arc<dyn Store>) -> Vec<Hash> {
        let w = source.write().await.unwrap();
        let a = w.create_chunk(json!("a"), vec![]).unwrap();
        let b = w.create_chunk(json!("b"), vec![]).unwrap();
        let root = w
            .create_chunk(json!("root"), vec![a.hash().clone(), b.hash().clone()])
            .unwrap();
        let hashes = vec![root.hash().clone(), a.hash().clone(), b.hash().clone()];
        for c in [a, b, root] {
            w.put_chunk(c).await.unwrap();
        }
        w.set_head("src", &hashes[0]).await.unwrap();
        w.commit().await.unwrap();
        hashes
    }

    async fn point_main_at(store: &LazyStore, hash: &Hash) {
        let w = store.write().await.unwrap();
        w.set_head("main", hash).await.unwrap();
        w.commit().await.unwrap();
    }

    // ---------------------------------------------------------------
    // Memory-only chunks
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn created_chunks_are_memory_only() {
        let source = source_store();
        let store = lazy(&source, 100);
        let w = store.lazy_write().await;
        let c = w.create_chunk(json!({"x": 1}), vec![]).unwrap();
        w.put_chunk(c.clone()).await.unwrap();
        assert!(w.is_mem_only_chunk_hash(c.hash()));
        w.set_head("main", c.hash()).await.unwrap();
        w.commit().await.unwrap();
        drop(w);

        let r = store.lazy_read().await;
        assert!(r.is_mem_only_chunk_hash(c.hash()));
        assert_eq!(r.get_chunk(c.hash()).await.unwrap(), Some(c.clone()));
        assert_eq!(r.get_head("main").await.unwrap(), Some(c.hash().clone()));
        drop(r);

        assert!(!store.is_cached(c.hash()));
        let sr = source.read().await.unwrap();
        assert!(!sr.has_chunk(c.hash()).await.unwrap());
        assert!(sr.get_head("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_hash_is_rejected() {
        let source = source_store();
        let store = lazy(&source, 100);
        let w = store.lazy_write().await;
        let c = Chunk::new(Hash::empty(), json!(1), vec![]).unwrap();
        assert!(matches!(w.put_chunk(c).await, Err(DagError::InvalidChunk { .. })));
        assert!(!w.is_mem_only_chunk_hash(&Hash::empty()));
    }

    #[tokio::test]
    async fn unreachable_memory_only_chunks_are_dropped() {
        let source = source_store();
        let store = lazy(&source, 100);
        let w = store.write().await.unwrap();
        let child = w.create_chunk(json!("child"), vec![]).unwrap();
        let parent = w.create_chunk(json!("parent"), vec![child.hash().clone()]).unwrap();
        w.put_chunk(child.clone()).await.unwrap();
        w.put_chunk(parent.clone()).await.unwrap();
        w.set_head("main", parent.hash()).await.unwrap();
        w.commit().await.unwrap();
        drop(w);

        let w = store.write().await.unwrap();
        w.remove_head("main").await.unwrap();
        w.commit().await.unwrap();
        drop(w);

        let r = store.lazy_read().await;
        assert!(!r.is_mem_only_chunk_hash(parent.hash()));
        assert!(!r.is_mem_only_chunk_hash(child.hash()));
        assert!(r.get_chunk(child.hash()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn uncommitted_write_leaves_no_trace() {
        let source = source_store();
        let store = lazy(&source, 100);
        let hash;
        {
            let w = store.write().await.unwrap();
            let c = w.create_chunk(json!(1), vec![]).unwrap();
            hash = c.hash().clone();
            w.put_chunk(c).await.unwrap();
            w.set_head("main", &hash).await.unwrap();
        }
        let r = store.read().await.unwrap();
        assert!(r.get_head("main").await.unwrap().is_none());
        assert!(!r.has_chunk(&hash).await.unwrap());
    }

    // ---------------------------------------------------------------
    // Source cache
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn reachable_source_chunks_are_cached_on_read() {
        let source = source_store();
        let h = seed_source(&source).await;
        let store = lazy(&source, 100);

        // Not reachable yet, so reading does not cache.
        let r = store.read().await.unwrap();
        assert!(r.get_chunk(&h[1]).await.unwrap().is_some());
        drop(r);
        assert!(!store.is_cached(&h[1]));

        point_main_at(&store, &h[0]).await;
        let r = store.read().await.unwrap();
        r.get_chunk(&h[0]).await.unwrap();
        r.get_chunk(&h[1]).await.unwrap();
        drop(r);
        assert!(store.is_cached(&h[0]));
        assert!(store.is_cached(&h[1]));
        assert!(!store.is_cached(&h[2]));
    }

    #[tokio::test]
    async fn cache_keeps_only_most_recently_used_within_budget() {
        let source = source_store();
        let h = seed_source(&source).await;
        // Two chunks of 10 bytes each do not fit into 15.
        let store = lazy(&source, 15);
        point_main_at(&store, &h[0]).await;

        let r = store.read().await.unwrap();
        for hash in &h {
            assert!(r.get_chunk(hash).await.unwrap().is_some());
        }
        drop(r);
        assert!(!store.is_cached(&h[0]));
        assert!(!store.is_cached(&h[1]));
        assert!(store.is_cached(&h[2]));
        assert_eq!(store.cache_size(), 10);

        // Evicted chunks are read through again.
        let r = store.read().await.unwrap();
        assert!(r.get_chunk(&h[1]).await.unwrap().is_some());
        drop(r);
        assert!(store.is_cached(&h[1]));
        assert!(!store.is_cached(&h[2]));
    }

    #[tokio::test]
    async fn write_cache_miss_is_cached_on_commit_when_reachable() {
        let source = source_store();
        let h = seed_source(&source).await;
        let store = lazy(&source, 100);

        let w = store.write().await.unwrap();
        assert!(w.get_chunk(&h[0]).await.unwrap().is_some());
        w.set_head("main", &h[0]).await.unwrap();
        w.commit().await.unwrap();
        drop(w);
        assert!(store.is_cached(&h[0]));

        // Moving the head away deletes the cached chunk.
        let w = store.write().await.unwrap();
        w.remove_head("main").await.unwrap();
        w.commit().await.unwrap();
        drop(w);
        assert!(!store.is_cached(&h[0]));
        assert_eq!(store.cache_size(), 0);
    }

    #[tokio::test]
    async fn chunks_persisted_moves_chunks_into_cache() {
        let source = source_store();
        let store = lazy(&source, 100);
        let w = store.write().await.unwrap();
        let c = w.create_chunk(json!("persist me"), vec![]).unwrap();
        w.put_chunk(c.clone()).await.unwrap();
        w.set_head("main", c.hash()).await.unwrap();
        w.commit().await.unwrap();
        drop(w);

        store.chunks_persisted(&[c.hash().clone()]).await;
        assert!(store.is_cached(c.hash()));
        let r = store.lazy_read().await;
        assert!(!r.is_mem_only_chunk_hash(c.hash()));
        assert_eq!(r.get_chunk(c.hash()).await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn suspended_deletes_wait_for_the_future() {
        let source = source_store();
        let h = seed_source(&source).await;
        let store = lazy(&source, 100);
        point_main_at(&store, &h[1]).await;
        store.read().await.unwrap().get_chunk(&h[1]).await.unwrap();
        assert!(store.is_cached(&h[1]));

        store
            .with_suspended_source_cache_evicts_and_deletes(async {
                let w = store.write().await.unwrap();
                w.remove_head("main").await.unwrap();
                w.commit().await.unwrap();
                drop(w);
                assert!(store.is_cached(&h[1]));
            })
            .await;
        assert!(!store.is_cached(&h[1]));
    }

    // ---------------------------------------------------------------
    // Isolation
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn write_waits_for_open_reads() {
        let source = source_store();
        let store = lazy(&source, 100);
        let r1 = store.read().await.unwrap();
        let r2 = store.read().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(20), store.write()).await;
        assert!(blocked.is_err());
        drop(r1);
        drop(r2);
        assert!(store.write().await.is_ok());
    }
}
