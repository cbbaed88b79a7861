//! Read operations shared by [`BTreeRead`] and [`BTreeWrite`](crate::BTreeWrite).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use replica_dag::Read;
use replica_types::{Hash, Value};
use serde::{Deserialize, Serialize};

use crate::error::{BTreeError, BTreeResult};
use crate::node::{search, Entry, Node};
use crate::splice::compute_splices;

// ---------------------------------------------------------------------------
// Diff operations
// ---------------------------------------------------------------------------

/// One difference between two versions of a map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InternalDiffOperation {
    /// `key` exists only in the newer version.
    Add { key: String, new_value: Value },
    /// `key` exists only in the older version.
    Del { key: String, old_value: Value },
    /// `key` exists in both with different values.
    Change {
        key: String,
        old_value: Value,
        new_value: Value,
    },
}

impl InternalDiffOperation {
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Del { key, .. } | Self::Change { key, .. } => key,
        }
    }
}

/// Diff operations in ascending key order.
pub type InternalDiff = Vec<InternalDiffOperation>;

/// Which operation [`all_entries_as_diff`] emits for every entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Add,
    Del,
}

// ---------------------------------------------------------------------------
// NodeSource
// ---------------------------------------------------------------------------

/// A tree root plus a way to load its nodes.
///
/// Every read operation is provided on top of [`NodeSource::get_node`], so a
/// read-only tree and a tree being edited answer queries identically.
#[async_trait]
pub trait NodeSource: Send + Sync {
    /// Load the node with the given hash. The empty hash is the empty tree.
    async fn get_node(&self, hash: &Hash) -> BTreeResult<Node>;

    /// Hash of the current root.
    fn root_hash(&self) -> Hash;

    /// Value stored under `key`.
    async fn get(&self, key: &str) -> BTreeResult<Option<Value>> {
        let mut node = self.get_node(&self.root_hash()).await?;
        loop {
            let i = match search(node.entries(), key) {
                Ok(i) if node.is_data() => return Ok(Some(node.entries()[i].value().clone())),
                Err(_) if node.is_data() => return Ok(None),
                Ok(i) | Err(i) => i,
            };
            if i == node.len() {
                return Ok(None);
            }
            node = self.get_node(&node.child_hash(i)?).await?;
        }
    }

    async fn has(&self, key: &str) -> BTreeResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn is_empty(&self) -> BTreeResult<bool> {
        Ok(self.get_node(&self.root_hash()).await?.is_empty())
    }

    /// Up to `limit` entries with keys `>= from_key`, ascending.
    ///
    /// Scanning again from the key after the last returned one continues
    /// where this page ended.
    async fn scan(&self, from_key: &str, limit: usize) -> BTreeResult<Vec<Entry>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        let root = self.get_node(&self.root_hash()).await?;
        let start = search(root.entries(), from_key).unwrap_or_else(|i| i);
        let mut stack: Vec<(Node, usize)> = vec![(root, start)];
        while let Some((node, i)) = stack.pop() {
            if i >= node.len() {
                continue;
            }
            if node.is_data() {
                for entry in &node.entries()[i..] {
                    out.push(entry.clone());
                    if out.len() == limit {
                        return Ok(out);
                    }
                }
                continue;
            }
            let child = self.get_node(&node.child_hash(i)?).await?;
            stack.push((node, i + 1));
            // Every subtree after the first one starts above `from_key`.
            let start = search(child.entries(), from_key).unwrap_or_else(|i| i);
            stack.push((child, start));
        }
        Ok(out)
    }

    /// Every entry, ascending.
    async fn entries(&self) -> BTreeResult<Vec<Entry>> {
        self.scan("", usize::MAX).await
    }

    /// Every key, ascending.
    async fn keys(&self) -> BTreeResult<Vec<String>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .map(|e| e.into_parts().0)
            .collect())
    }

    /// Changes from the tree rooted at `last` to this tree.
    ///
    /// Both trees must come from the same store. Subtrees shared by both
    /// sides are skipped without being loaded.
    async fn diff(&self, last: &Hash) -> BTreeResult<InternalDiff> {
        let current = self.root_hash();
        let mut out = InternalDiff::new();
        if *last == current {
            return Ok(out);
        }
        let last_node = self.get_node(last).await?;
        let current_node = self.get_node(&current).await?;
        let mut work: Vec<(Span, Span)> = vec![(last_node.into(), current_node.into())];

        while let Some((mut last, mut current)) = work.pop() {
            while last.level > current.level {
                last = expand(self, &last, 0, last.entries.len()).await?;
            }
            while current.level > last.level {
                current = expand(self, &current, 0, current.entries.len()).await?;
            }
            if last.level == 0 {
                diff_entries(&last.entries, &current.entries, &mut out);
                continue;
            }
            let splices = compute_splices(&last.entries, &current.entries);
            let mut pairs = Vec::with_capacity(splices.len());
            for s in &splices {
                let l = expand(self, &last, s.at, s.removed).await?;
                let c = expand(self, &current, s.from, s.added).await?;
                pairs.push((l, c));
            }
            work.extend(pairs.into_iter().rev());
        }
        Ok(out)
    }
}

/// Entries of one level of a tree, possibly gathered from several nodes.
struct Span {
    origin: Hash,
    level: usize,
    entries: Arc<[Entry]>,
}

impl From<Node> for Span {
    fn from(node: Node) -> Self {
        Self {
            origin: node.hash().clone(),
            level: node.level(),
            entries: node.shared_entries(),
        }
    }
}

/// The entries of children `start..start + len` of `span`, one level down.
async fn expand<S: NodeSource + ?Sized>(
    src: &S,
    span: &Span,
    start: usize,
    len: usize,
) -> BTreeResult<Span> {
    let level = span.level - 1;
    let mut entries: Vec<Entry> = Vec::new();
    for entry in &span.entries[start..start + len] {
        let hash = entry.child_hash().ok_or_else(|| BTreeError::InvalidNode {
            hash: span.origin.clone(),
            reason: format!("entry {:?} is not a child pointer", entry.key()),
        })?;
        let child = src.get_node(&hash).await?;
        if child.level() != level {
            return Err(BTreeError::InvalidNode {
                hash,
                reason: format!("expected level {level}, found {}", child.level()),
            });
        }
        entries.extend(child.entries().iter().cloned());
    }
    Ok(Span {
        origin: span.origin.clone(),
        level,
        entries: entries.into(),
    })
}

/// Linear merge of two sorted data entry lists.
fn diff_entries(last: &[Entry], current: &[Entry], out: &mut InternalDiff) {
    let (mut i, mut j) = (0, 0);
    while i < last.len() && j < current.len() {
        let (l, c) = (&last[i], &current[j]);
        match l.key().cmp(c.key()) {
            Ordering::Equal => {
                if l.value() != c.value() {
                    out.push(InternalDiffOperation::Change {
                        key: l.key().to_owned(),
                        old_value: l.value().clone(),
                        new_value: c.value().clone(),
                    });
                }
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                out.push(InternalDiffOperation::Del {
                    key: l.key().to_owned(),
                    old_value: l.value().clone(),
                });
                i += 1;
            }
            Ordering::Greater => {
                out.push(InternalDiffOperation::Add {
                    key: c.key().to_owned(),
                    new_value: c.value().clone(),
                });
                j += 1;
            }
        }
    }
    out.extend(last[i..].iter().map(|l| InternalDiffOperation::Del {
        key: l.key().to_owned(),
        old_value: l.value().clone(),
    }));
    out.extend(current[j..].iter().map(|c| InternalDiffOperation::Add {
        key: c.key().to_owned(),
        new_value: c.value().clone(),
    }));
}

/// Every entry of `tree` as an add or a del, ascending.
pub async fn all_entries_as_diff<S: NodeSource + ?Sized>(
    tree: &S,
    kind: DiffKind,
) -> BTreeResult<InternalDiff> {
    Ok(tree
        .entries()
        .await?
        .into_iter()
        .map(|e| {
            let (key, value) = e.into_parts();
            match kind {
                DiffKind::Add => InternalDiffOperation::Add { key, new_value: value },
                DiffKind::Del => InternalDiffOperation::Del { key, old_value: value },
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// BTreeRead
// ---------------------------------------------------------------------------

/// Read-only view of the tree rooted at a fixed hash.
///
/// Nodes are cached for the lifetime of the view.
pub struct BTreeRead<'a, R: Read + ?Sized> {
    dag_read: &'a R,
    root_hash: Hash,
    cache: Mutex<HashMap<Hash, Node>>,
}

impl<'a, R: Read + ?Sized> BTreeRead<'a, R> {
    pub fn new(dag_read: &'a R, root_hash: Hash) -> Self {
        Self {
            dag_read,
            root_hash,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Read + ?Sized> std::fmt::Debug for BTreeRead<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeRead").field("root_hash", &self.root_hash).finish()
    }
}

#[async_trait]
impl<R: Read + ?Sized> NodeSource for BTreeRead<'_, R> {
    async fn get_node(&self, hash: &Hash) -> BTreeResult<Node> {
        load_node(self.dag_read, &self.cache, hash).await
    }

    fn root_hash(&self) -> Hash {
        self.root_hash.clone()
    }
}

/// Load a node through a per-tree cache.
pub(crate) async fn load_node<R: Read + ?Sized>(
    read: &R,
    cache: &Mutex<HashMap<Hash, Node>>,
    hash: &Hash,
) -> BTreeResult<Node> {
    if hash.is_empty() {
        return Ok(Node::empty());
    }
    let cached = cache.lock().expect("lock poisoned").get(hash).cloned();
    if let Some(node) = cached {
        return Ok(node);
    }
    let chunk = read.must_get_chunk(hash).await?;
    let node = Node::from_chunk(&chunk)?;
    cache
        .lock()
        .expect("lock poisoned")
        .insert(hash.clone(), node.clone());
    Ok(node)
}
