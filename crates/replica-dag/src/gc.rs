//! Incremental reference counting.
//!
//! When a write commits, only the heads it moved and the chunks it put can
//! change reachability. [`compute_ref_count_updates`] walks forward from
//! those roots and computes the new count of every hash it touches. It never
//! modifies the store; the caller applies the returned map in one pass and
//! deletes every hash whose count is zero.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use replica_types::Hash;

use crate::error::{DagError, DagResult};

/// Old and new value of a head changed by a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadChange {
    pub old: Option<Hash>,
    pub new: Option<Hash>,
}

/// Supplies ref information for [`compute_ref_count_updates`].
#[async_trait]
pub trait RefCountUpdatesDelegate: Send + Sync {
    /// Current persisted ref count of `hash`, if any.
    async fn get_ref_count(&self, hash: &Hash) -> DagResult<Option<u32>>;

    /// Refs of `hash`.
    ///
    /// A non-lazy delegate must always return `Some`. A lazy delegate may
    /// return `None` for chunks it has not loaded, but never for put chunks.
    async fn get_refs(&self, hash: &Hash) -> DagResult<Option<Vec<Hash>>>;

    /// Whether this delegate loads refs lazily. If so, put chunks may have
    /// been reachable before the write without their refs being counted,
    /// and [`are_refs_counted`](Self::are_refs_counted) tells them apart.
    fn is_lazy(&self) -> bool {
        false
    }

    /// Only consulted when [`is_lazy`](Self::is_lazy) is `true`.
    fn are_refs_counted(&self, _hash: &Hash) -> bool {
        true
    }
}

/// Compute how ref counts change when a write is committed.
///
/// The returned map contains the new count of every hash whose count was
/// loaded, and an entry for every put chunk (zero if the chunk is not
/// reachable from any head). Hashes mapped to zero must be deleted.
pub async fn compute_ref_count_updates<D>(
    head_changes: &[HeadChange],
    put_chunks: &HashSet<Hash>,
    delegate: &D,
) -> DagResult<HashMap<Hash, u32>>
where
    D: RefCountUpdatesDelegate + ?Sized,
{
    let mut new_heads = Vec::new();
    let mut old_heads = Vec::new();
    for change in head_changes {
        if change.old != change.new {
            old_heads.extend(change.old.iter().cloned());
            new_heads.extend(change.new.iter().cloned());
        }
    }

    let mut updates = RefCountUpdates {
        delegate,
        put_chunks,
        counts: HashMap::new(),
        refs_counted: HashSet::new(),
    };

    for head in &new_heads {
        updates.change_ref_count(head, 1).await?;
    }

    // Every put chunk gets an entry, zero for new chunks that are not
    // reachable from the new heads.
    for hash in put_chunks {
        updates.ensure_loaded(hash).await?;
    }

    if delegate.is_lazy() {
        loop {
            let next = put_chunks.iter().find(|hash| {
                !delegate.are_refs_counted(hash)
                    && !updates.refs_counted.contains(*hash)
                    && updates.counts.get(*hash) != Some(&0)
            });
            let Some(hash) = next.cloned() else { break };
            updates.change_refs_of(&hash, 1).await?;
        }
    }

    for head in &old_heads {
        updates.change_ref_count(head, -1).await?;
    }

    let mut result = HashMap::with_capacity(updates.counts.len());
    for (hash, count) in updates.counts {
        let count = u32::try_from(count)
            .map_err(|_| DagError::RefCountInvariant { hash: hash.clone(), count })?;
        result.insert(hash, count);
    }
    Ok(result)
}

struct RefCountUpdates<'a, D: ?Sized> {
    delegate: &'a D,
    put_chunks: &'a HashSet<Hash>,
    counts: HashMap<Hash, i64>,
    refs_counted: HashSet<Hash>,
}

impl<D> RefCountUpdates<'_, D>
where
    D: RefCountUpdatesDelegate + ?Sized,
{
    /// Load the count of `hash` once; later updates only touch `counts`.
    async fn ensure_loaded(&mut self, hash: &Hash) -> DagResult<i64> {
        if let Some(count) = self.counts.get(hash) {
            return Ok(*count);
        }
        let count = i64::from(self.delegate.get_ref_count(hash).await?.unwrap_or(0));
        self.counts.insert(hash.clone(), count);
        Ok(count)
    }

    /// Apply `delta` to `hash`, cascading into refs whenever a count crosses
    /// between zero and one.
    async fn change_ref_count(&mut self, hash: &Hash, delta: i64) -> DagResult<()> {
        let mut work: VecDeque<Hash> = VecDeque::from([hash.clone()]);
        while let Some(hash) = work.pop_front() {
            let old = self.ensure_loaded(&hash).await?;
            self.counts.insert(hash.clone(), old + delta);
            let crossed = (old == 0 && delta == 1) || (old == 1 && delta == -1);
            if crossed {
                if let Some(refs) = self.load_refs(&hash).await? {
                    work.extend(refs);
                }
            }
        }
        Ok(())
    }

    async fn change_refs_of(&mut self, hash: &Hash, delta: i64) -> DagResult<()> {
        if let Some(refs) = self.load_refs(hash).await? {
            for r in refs {
                self.change_ref_count(&r, delta).await?;
            }
        }
        Ok(())
    }

    async fn load_refs(&mut self, hash: &Hash) -> DagResult<Option<Vec<Hash>>> {
        if hash.is_empty() {
            return Ok(None);
        }
        let refs = self.delegate.get_refs(hash).await?;
        match &refs {
            Some(_) => {
                self.refs_counted.insert(hash.clone());
            }
            None if !self.delegate.is_lazy() || self.put_chunks.contains(hash) => {
                return Err(DagError::InvalidChunk {
                    hash: hash.clone(),
                    reason: "refs must be defined".to_owned(),
                });
            }
            None => {}
        }
        Ok(refs)
    }
}
