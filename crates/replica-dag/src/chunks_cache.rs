//! Byte-budgeted LRU cache of source-store chunks, plus the ref-count
//! bookkeeping shared with memory-only chunks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use replica_types::Hash;
use tracing::debug;

use crate::chunk::Chunk;

/// Measures the number of bytes a chunk costs in the cache.
pub type ChunkSizer = Arc<dyn Fn(&Chunk) -> usize + Send + Sync>;

/// Sizer used when none is configured: [`Chunk::size`].
pub fn default_chunk_sizer() -> ChunkSizer {
    Arc::new(Chunk::size)
}

struct CacheEntry {
    chunk: Chunk,
    size: usize,
    tick: u64,
}

/// LRU cache of chunks read from a source store.
///
/// `ref_counts` counts reachability from the owning store's heads through
/// every chunk whose refs have been discovered. `refs` records those
/// discovered refs. Evicting a chunk only drops its cache entry; its count
/// and refs stay until the chunk becomes unreachable, so a later read can
/// cache it again without recounting.
pub(crate) struct ChunksCache {
    limit: usize,
    sizer: ChunkSizer,
    size: usize,
    entries: HashMap<Hash, CacheEntry>,
    /// Least recently used first.
    lru: BTreeMap<u64, Hash>,
    next_tick: u64,
    pub(crate) ref_counts: HashMap<Hash, u32>,
    pub(crate) refs: HashMap<Hash, Arc<[Hash]>>,
    suspended: usize,
    suspended_deletes: Vec<Hash>,
}

impl ChunksCache {
    pub(crate) fn new(limit: usize, sizer: ChunkSizer) -> Self {
        Self {
            limit,
            sizer,
            size: 0,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_tick: 0,
            ref_counts: HashMap::new(),
            refs: HashMap::new(),
            suspended: 0,
            suspended_deletes: Vec::new(),
        }
    }

    /// Total size of the cached chunks.
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Look up a chunk and mark it most recently used.
    pub(crate) fn get(&mut self, hash: &Hash) -> Option<Chunk> {
        self.touch(hash);
        self.entries.get(hash).map(|entry| entry.chunk.clone())
    }

    /// Look up a chunk without changing its LRU position.
    pub(crate) fn peek(&self, hash: &Hash) -> Option<&Chunk> {
        self.entries.get(hash).map(|entry| &entry.chunk)
    }

    /// Cache a chunk read from the source store.
    ///
    /// Only chunks known to be reachable (positive ref count) are cached.
    /// The first time a chunk is cached its refs are counted.
    pub(crate) fn put(&mut self, chunk: Chunk) {
        if self.touch(chunk.hash()) {
            return;
        }
        if self.ref_counts.get(chunk.hash()).copied().unwrap_or(0) < 1 {
            return;
        }
        let hash = chunk.hash().clone();
        let meta = chunk.shared_meta();
        if !self.cache_chunk(chunk, None) {
            return;
        }
        if !self.refs.contains_key(&hash) {
            for r in meta.iter() {
                *self.ref_counts.entry(r.clone()).or_insert(0) += 1;
            }
            self.refs.insert(hash, meta);
        }
        self.ensure_limit();
    }

    /// Apply the ref-count updates of a committed write.
    ///
    /// Hashes whose count dropped to zero are deleted (or queued while
    /// deletes are suspended). Reachable chunks from `to_put` are cached.
    pub(crate) fn update_for_commit(
        &mut self,
        to_put: &HashMap<Hash, (Chunk, Option<usize>)>,
        updates: HashMap<Hash, u32>,
    ) {
        for (hash, count) in updates {
            if count == 0 {
                if self.suspended == 0 {
                    self.delete(&hash);
                } else {
                    self.ref_counts.insert(hash.clone(), 0);
                    self.suspended_deletes.push(hash);
                }
                continue;
            }
            self.ref_counts.insert(hash.clone(), count);
            let Some((chunk, size)) = to_put.get(&hash) else {
                continue;
            };
            if !self.touch(&hash) {
                self.cache_chunk(chunk.clone(), *size);
                self.refs.insert(hash, chunk.shared_meta());
            }
        }
        self.ensure_limit();
    }

    /// Cache chunks that just became durable in the source store.
    ///
    /// A chunk that is already cached is only touched. Caching it again
    /// would add its size to the total a second time.
    pub(crate) fn persisted(&mut self, chunks: Vec<Chunk>) {
        for chunk in chunks {
            if !self.touch(chunk.hash()) {
                self.cache_chunk(chunk, None);
            }
        }
        self.ensure_limit();
    }

    pub(crate) fn suspend(&mut self) {
        self.suspended += 1;
    }

    /// End one suspension. When the last one ends, queued deletes of hashes
    /// still at zero are applied and the size limit is enforced.
    pub(crate) fn resume(&mut self) {
        self.suspended = self.suspended.saturating_sub(1);
        if self.suspended > 0 {
            return;
        }
        for hash in std::mem::take(&mut self.suspended_deletes) {
            if self.ref_counts.get(&hash) == Some(&0) {
                self.delete(&hash);
            }
        }
        self.ensure_limit();
    }

    /// Returns `true` if `hash` was cached.
    fn touch(&mut self, hash: &Hash) -> bool {
        let Some(entry) = self.entries.get_mut(hash) else {
            return false;
        };
        self.lru.remove(&entry.tick);
        entry.tick = self.next_tick;
        self.lru.insert(self.next_tick, hash.clone());
        self.next_tick += 1;
        true
    }

    /// Chunks larger than the whole budget are never cached and never
    /// evict others.
    fn cache_chunk(&mut self, chunk: Chunk, size: Option<usize>) -> bool {
        let size = size.unwrap_or_else(|| (self.sizer)(&chunk));
        if size > self.limit {
            return false;
        }
        let hash = chunk.hash().clone();
        let tick = self.next_tick;
        self.next_tick += 1;
        self.size += size;
        self.lru.insert(tick, hash.clone());
        self.entries.insert(hash, CacheEntry { chunk, size, tick });
        true
    }

    fn ensure_limit(&mut self) {
        if self.suspended > 0 {
            return;
        }
        while self.size > self.limit {
            let Some((_, hash)) = self.lru.pop_first() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&hash) {
                self.size -= entry.size;
                debug!(hash = %hash, size = entry.size, "evicted chunk from source cache");
            }
        }
    }

    fn delete(&mut self, hash: &Hash) {
        self.ref_counts.remove(hash);
        self.refs.remove(hash);
        if let Some(entry) = self.entries.remove(hash) {
            self.lru.remove(&entry.tick);
            self.size -= entry.size;
        }
    }
}
