//! B-tree nodes and the size-bounded partitioning used to split them.
//!
//! A node is stored as a chunk whose data is `[level, [[key, value, size], ...]]`.
//! Level 0 nodes hold the map's entries. Higher levels hold one entry per
//! child: the child's maximum key and its hash.

use std::sync::Arc;

use replica_dag::Chunk;
use replica_types::{size_of_value, Hash, Value};
use serde_json::json;

use crate::error::{BTreeError, BTreeResult};

/// Fixed per-node overhead counted towards a node's size.
pub const NODE_HEADER_SIZE: usize = 11;

/// Overhead of the `[key, value, size]` triple around the key and value.
const ENTRY_OVERHEAD: usize = 16;

/// Estimated size of one entry, matching `size_of_value([key, value, 0])`.
pub fn entry_size(key: &str, value: &Value) -> usize {
    ENTRY_OVERHEAD + key.len() + size_of_value(value)
}

/// One key/value pair of a node, with its cached size.
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    key: String,
    value: Value,
    size: usize,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        let size = entry_size(&key, &value);
        Self { key, value, size }
    }

    /// The entry pointing at `hash` from its parent.
    pub(crate) fn child(key: impl Into<String>, hash: &Hash) -> Self {
        Self::new(key, Value::String(hash.to_string()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.key, self.value)
    }

    pub(crate) fn child_hash(&self) -> Option<Hash> {
        self.value.as_str().and_then(|s| Hash::parse(s).ok())
    }
}

/// Locate `key` in sorted `entries`: `Ok(index)` if present, otherwise
/// `Err(index)` where it would be inserted. Keys compare by UTF-8 bytes.
pub fn search(entries: &[Entry], key: &str) -> Result<usize, usize> {
    entries.binary_search_by(|e| e.key.as_str().cmp(key))
}

/// An immutable B-tree node.
///
/// Cloning is cheap; the entries are shared.
#[derive(Clone, Debug)]
pub struct Node {
    hash: Hash,
    level: usize,
    entries: Arc<[Entry]>,
}

impl Node {
    pub fn new(hash: Hash, level: usize, entries: Vec<Entry>) -> Self {
        Self {
            hash,
            level,
            entries: entries.into(),
        }
    }

    /// The empty data node every tree starts from.
    pub fn empty() -> Self {
        Self::new(Hash::empty(), 0, Vec::new())
    }

    /// Decode a node chunk.
    ///
    /// Entries written without a size get one computed. Internal entries
    /// must carry valid hashes and keys must be strictly ascending.
    pub fn from_chunk(chunk: &Chunk) -> BTreeResult<Self> {
        let hash = chunk.hash();
        let invalid = |reason: &str| BTreeError::InvalidNode {
            hash: hash.clone(),
            reason: reason.to_owned(),
        };

        let (level, raw) = match chunk.data().as_array().map(Vec::as_slice) {
            Some([level, raw]) => (level, raw),
            _ => return Err(invalid("expected [level, entries]")),
        };
        let level = level
            .as_u64()
            .and_then(|level| usize::try_from(level).ok())
            .ok_or_else(|| invalid("level must be a non-negative integer"))?;
        let raw = raw.as_array().ok_or_else(|| invalid("entries must be an array"))?;

        let mut entries: Vec<Entry> = Vec::with_capacity(raw.len());
        for item in raw {
            let (key, value, size) = match item.as_array().map(Vec::as_slice) {
                Some([k, v]) => (k, v, None),
                Some([k, v, s]) => (k, v, Some(s)),
                _ => return Err(invalid("entry must be [key, value] or [key, value, size]")),
            };
            let key = key.as_str().ok_or_else(|| invalid("entry key must be a string"))?;
            if level > 0 && !value.as_str().is_some_and(|s| Hash::parse(s).is_ok()) {
                return Err(invalid("internal entry value must be a hash"));
            }
            let size = match size {
                Some(s) => s
                    .as_u64()
                    .and_then(|size| usize::try_from(size).ok())
                    .ok_or_else(|| invalid("entry size must be an integer"))?,
                None => entry_size(key, value),
            };
            if entries.last().is_some_and(|prev| prev.key.as_str() >= key) {
                return Err(invalid("entry keys must be strictly ascending"));
            }
            entries.push(Entry {
                key: key.to_owned(),
                value: value.clone(),
                size,
            });
        }
        Ok(Self::new(hash.clone(), level, entries))
    }

    /// Chunk data for this node.
    pub fn to_chunk_data(&self) -> Value {
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|e| json!([e.key, e.value, e.size]))
            .collect();
        json!([self.level, entries])
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// The same entries under another hash.
    pub(crate) fn with_hash(&self, hash: Hash) -> Self {
        Self {
            hash,
            level: self.level,
            entries: Arc::clone(&self.entries),
        }
    }

    pub(crate) fn shared_entries(&self) -> Arc<[Entry]> {
        Arc::clone(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` for level 0 nodes.
    pub fn is_data(&self) -> bool {
        self.level == 0
    }

    /// Largest key in this node, or `""` when it is empty.
    pub fn max_key(&self) -> &str {
        self.entries.last().map_or("", |e| e.key.as_str())
    }

    /// Header plus the size of every entry.
    pub fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.entries.iter().map(|e| e.size).sum::<usize>()
    }

    /// Hash of the child behind entry `i` of an internal node.
    pub fn child_hash(&self, i: usize) -> BTreeResult<Hash> {
        self.entries
            .get(i)
            .and_then(Entry::child_hash)
            .ok_or_else(|| BTreeError::InvalidNode {
                hash: self.hash.clone(),
                reason: format!("entry {i} is not a child pointer"),
            })
    }

    /// Hashes of every child, in key order.
    pub fn child_hashes(&self) -> BTreeResult<Vec<Hash>> {
        (0..self.entries.len()).map(|i| self.child_hash(i)).collect()
    }

    /// The entry a parent holds for this node.
    pub(crate) fn parent_entry(&self) -> Entry {
        Entry::child(self.max_key(), &self.hash)
    }
}

/// Split `values` greedily into runs whose summed size is at least `min`.
///
/// A value of `max` or more always gets a run of its own. A trailing run
/// below `min` is appended to the previous run when the result stays within
/// `max`.
pub fn partition<T>(
    values: Vec<T>,
    size_of: impl Fn(&T) -> usize,
    min: usize,
    max: usize,
) -> Vec<Vec<T>> {
    let mut partitions: Vec<Vec<T>> = Vec::new();
    let mut sizes: Vec<usize> = Vec::new();
    let mut sum = 0;
    let mut accum: Vec<T> = Vec::new();

    for value in values {
        let size = size_of(&value);
        if size >= max {
            if !accum.is_empty() {
                partitions.push(std::mem::take(&mut accum));
                sizes.push(sum);
            }
            partitions.push(vec![value]);
            sizes.push(size);
            sum = 0;
        } else if sum + size >= min {
            accum.push(value);
            partitions.push(std::mem::take(&mut accum));
            sizes.push(sum + size);
            sum = 0;
        } else {
            sum += size;
            accum.push(value);
        }
    }

    if !accum.is_empty() {
        match (sizes.last(), partitions.last_mut()) {
            (Some(&last), Some(tail)) if sum + last <= max => tail.append(&mut accum),
            _ => partitions.push(accum),
        }
    }
    partitions
}
