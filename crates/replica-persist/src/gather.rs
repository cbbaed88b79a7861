//! Visitors that decide which chunks move between the memory and durable
//! stores.

use std::collections::HashMap;

use async_trait::async_trait;
use replica_dag::{ChunkSizer, Chunk, DagResult, LazyRead, LazyStore, Read, Visitor};
use replica_types::Hash;

/// Collects the memory-only chunks reachable from a memdag commit.
///
/// Stops at `stop_at` (the durable head, already persisted) and at any chunk
/// that is not memory-only: a chunk that came from the durable store only
/// references chunks that are there too.
pub struct GatherMemdagVisitor<'a> {
    memdag: &'a LazyRead,
    stop_at: Hash,
    gathered: HashMap<Hash, Chunk>,
}

impl<'a> GatherMemdagVisitor<'a> {
    pub fn new(memdag: &'a LazyRead, stop_at: Hash) -> Self {
        Self {
            memdag,
            stop_at,
            gathered: HashMap::new(),
        }
    }

    pub fn into_gathered(self) -> HashMap<Hash, Chunk> {
        self.gathered
    }
}

#[async_trait]
impl Visitor for GatherMemdagVisitor<'_> {
    async fn should_visit(&mut self, hash: &Hash) -> DagResult<bool> {
        Ok(*hash != self.stop_at && self.memdag.is_mem_only_chunk_hash(hash))
    }

    async fn visit_chunk(&mut self, chunk: &Chunk) -> DagResult<()> {
        self.gathered.insert(chunk.hash().clone(), chunk.clone());
        Ok(())
    }
}

/// Narrows gathered chunks to those the durable store does not have yet.
///
/// Walked over the memdag graph. A chunk already durable is skipped along
/// with everything under it.
pub struct RestrictVisitor<'a, R: Read + ?Sized> {
    perdag: &'a R,
    gathered: &'a HashMap<Hash, Chunk>,
    restricted: HashMap<Hash, Chunk>,
}

impl<'a, R: Read + ?Sized> RestrictVisitor<'a, R> {
    pub fn new(perdag: &'a R, gathered: &'a HashMap<Hash, Chunk>) -> Self {
        Self {
            perdag,
            gathered,
            restricted: HashMap::new(),
        }
    }

    pub fn into_restricted(self) -> HashMap<Hash, Chunk> {
        self.restricted
    }
}

#[async_trait]
impl<R: Read + ?Sized> Visitor for RestrictVisitor<'_, R> {
    async fn should_visit(&mut self, hash: &Hash) -> DagResult<bool> {
        Ok(self.gathered.contains_key(hash) && !self.perdag.has_chunk(hash).await?)
    }

    async fn visit_chunk(&mut self, chunk: &Chunk) -> DagResult<()> {
        self.restricted.insert(chunk.hash().clone(), chunk.clone());
        Ok(())
    }
}

/// Collects durable chunks the memdag has not cached, up to a byte budget.
///
/// Commit chunks list their basis first, so history is gathered before the
/// value and index trees of each commit.
pub struct GatherNotCachedVisitor<'a> {
    memdag: &'a LazyStore,
    size_limit: usize,
    sizer: ChunkSizer,
    total_size: usize,
    gathered: Vec<(Chunk, usize)>,
}

impl<'a> GatherNotCachedVisitor<'a> {
    pub fn new(memdag: &'a LazyStore, size_limit: usize, sizer: ChunkSizer) -> Self {
        Self {
            memdag,
            size_limit,
            sizer,
            total_size: 0,
            gathered: Vec::new(),
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Gathered chunks with their sizes, in visit order.
    pub fn into_gathered(self) -> Vec<(Chunk, usize)> {
        self.gathered
    }
}

#[async_trait]
impl Visitor for GatherNotCachedVisitor<'_> {
    async fn should_visit(&mut self, hash: &Hash) -> DagResult<bool> {
        Ok(self.total_size < self.size_limit && !self.memdag.is_cached(hash))
    }

    async fn visit_chunk(&mut self, chunk: &Chunk) -> DagResult<()> {
        if self.total_size < self.size_limit {
            let size = (self.sizer)(chunk);
            self.gathered.push((chunk.clone(), size));
            self.total_size += size;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use replica_dag::{default_chunk_sizer, walk, LazyStoreConfig, Store, StoreImpl, Write};
    use replica_kv::MemKvStore;
    use replica_types::fake_hasher;
    use serde_json::json;

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    /// `top -> mid -> leaf` in `store`, committed under head `h`.
    async fn chain(store: &dyn Store, tag: &str) -> Vec<Hash> {
        let w = store.write().await.unwrap();
        let leaf = w.create_chunk(json!(format!("{tag}-leaf")), vec![]).unwrap();
        let mid = w.create_chunk(json!(format!("{tag}-mid")), vec![leaf.hash().clone()]).unwrap();
        let top = w.create_chunk(json!(format!("{tag}-top")), vec![mid.hash().clone()]).unwrap();
        let hashes = vec![top.hash().clone(), mid.hash().clone(), leaf.hash().clone()];
        for chunk in [leaf, mid, top] {
            w.put_chunk(chunk).await.unwrap();
        }
        w.set_head("h", &hashes[0]).await.unwrap();
        w.commit().await.unwrap();
        hashes
    }

    fn new_lazy(perdag: &Arc<StoreImpl>, limit: usize) -> LazyStore {
        let source: Arc<dyn Store> = perdag.clone();
        LazyStore::new(source, &LazyStoreConfig::with_limit(limit), fake_hasher("a1"))
    }

    // ---------------------------------------------------------------
    // Tests
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn memdag_gather_skips_durable_chunks_and_the_stop_hash() {
        let perdag = Arc::new(StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("a0")));
        let durable = chain(&*perdag, "p").await;
        let memdag = new_lazy(&perdag, 1 << 20);

        let w = memdag.lazy_write().await;
        let mem = w.create_chunk(json!("mem"), vec![durable[0].clone()]).unwrap();
        let stop = w.create_chunk(json!("stop"), vec![]).unwrap();
        let root = w.create_chunk(json!("root"), vec![mem.hash().clone(), stop.hash().clone()]).unwrap();
        for chunk in [mem.clone(), stop.clone(), root.clone()] {
            w.put_chunk(chunk).await.unwrap();
        }
        w.set_head("main", root.hash()).await.unwrap();
        w.commit().await.unwrap();
        drop(w);

        let r = memdag.lazy_read().await;
        let mut visitor = GatherMemdagVisitor::new(&r, stop.hash().clone());
        walk(&r, root.hash(), &mut visitor).await.unwrap();
        let gathered = visitor.into_gathered();
        let mut keys: Vec<&Hash> = gathered.keys().collect();
        keys.sort();
        let mut expected = vec![root.hash(), mem.hash()];
        expected.sort();
        assert_eq!(keys, expected);

        let perdag_read = perdag.read().await.unwrap();
        let mut restrict = RestrictVisitor::new(&*perdag_read, &gathered);
        walk(&r, root.hash(), &mut restrict).await.unwrap();
        assert_eq!(restrict.into_restricted().len(), 2);
    }

    #[tokio::test]
    async fn restrict_drops_chunks_already_durable() {
        let perdag = Arc::new(StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("a2")));
        let durable = chain(&*perdag, "p").await;
        let memdag = new_lazy(&perdag, 1 << 20);
        let r = memdag.lazy_read().await;
        let gathered: HashMap<Hash, Chunk> = [(durable[0].clone(), r.must_get_chunk(&durable[0]).await.unwrap())].into();

        let perdag_read = perdag.read().await.unwrap();
        let mut restrict = RestrictVisitor::new(&*perdag_read, &gathered);
        walk(&r, &durable[0], &mut restrict).await.unwrap();
        assert!(restrict.into_restricted().is_empty());
    }

    #[tokio::test]
    async fn not_cached_gather_respects_cache_and_budget() {
        let perdag = Arc::new(StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("a3")));
        let hashes = chain(&*perdag, "p").await;
        let memdag = new_lazy(&perdag, 1 << 20);
        // Only chunks reachable from a memdag head are cached on read.
        let w = memdag.lazy_write().await;
        w.set_head("main", &hashes[2]).await.unwrap();
        w.commit().await.unwrap();
        drop(w);
        {
            let r = memdag.lazy_read().await;
            r.must_get_chunk(&hashes[2]).await.unwrap();
        }
        assert!(memdag.is_cached(&hashes[2]));
        assert!(!memdag.is_cached(&hashes[1]));

        let r = perdag.read().await.unwrap();
        let mut visitor = GatherNotCachedVisitor::new(&memdag, usize::MAX, default_chunk_sizer());
        walk(&*r, &hashes[0], &mut visitor).await.unwrap();
        let gathered: Vec<Hash> = visitor.into_gathered().into_iter().map(|(c, _)| c.hash().clone()).collect();
        assert_eq!(gathered, hashes[..2].to_vec());

        let one_byte: ChunkSizer = Arc::new(|_: &Chunk| 1);
        let mut visitor = GatherNotCachedVisitor::new(&memdag, 1, one_byte);
        walk(&*r, &hashes[0], &mut visitor).await.unwrap();
        assert_eq!(visitor.total_size(), 1);
        assert_eq!(visitor.into_gathered().len(), 1);
    }
}
