//! Copy-on-write edits over a DAG write transaction.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use replica_dag::{Chunk, Write};
use replica_types::{Hash, TempHashes, Value};
use serde_json::json;
use tracing::debug;

use crate::config::BTreeConfig;
use crate::error::{BTreeError, BTreeResult};
use crate::node::{partition, search, Entry, Node, NODE_HEADER_SIZE};
use crate::read::{load_node, NodeSource};

/// A B-tree being edited inside a DAG write.
///
/// Edited nodes get temp hashes and live in memory until [`flush`] turns
/// them into chunks. `put`, `del`, `clear`, and `flush` are serialized on one
/// async mutex so that two edits can never start from the same root and
/// silently drop one another. Reads never take that mutex.
///
/// [`flush`]: BTreeWrite::flush
pub struct BTreeWrite<'a, W: Write + ?Sized> {
    dag_write: &'a W,
    config: BTreeConfig,
    edit_lock: tokio::sync::Mutex<()>,
    root_hash: RwLock<Hash>,
    modified: RwLock<HashMap<Hash, Node>>,
    cache: Mutex<HashMap<Hash, Node>>,
    temp_hashes: TempHashes,
}

impl<'a, W: Write + ?Sized> BTreeWrite<'a, W> {
    /// Edit the tree at `root_hash` with the default node bounds.
    pub fn new(dag_write: &'a W, root_hash: Hash) -> Self {
        Self::build(dag_write, root_hash, BTreeConfig::default())
    }

    /// Edit the tree at `root_hash` with custom node bounds.
    pub fn with_config(
        dag_write: &'a W,
        root_hash: Hash,
        config: BTreeConfig,
    ) -> BTreeResult<Self> {
        config.validate()?;
        Ok(Self::build(dag_write, root_hash, config))
    }

    fn build(dag_write: &'a W, root_hash: Hash, config: BTreeConfig) -> Self {
        Self {
            dag_write,
            config,
            edit_lock: tokio::sync::Mutex::new(()),
            root_hash: RwLock::new(root_hash),
            modified: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            temp_hashes: TempHashes::new(),
        }
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// Insert or replace `key`.
    pub async fn put(&self, key: &str, value: Value) -> BTreeResult<()> {
        let _guard = self.edit_lock.lock().await;
        let (mut path, leaf) = self.descend(key).await?;

        let mut entries = leaf.entries().to_vec();
        let entry = Entry::new(key, value);
        match search(&entries, key) {
            Ok(i) => entries[i] = entry,
            Err(i) => entries.insert(i, entry),
        }
        let mut child = self.new_node(0, entries);

        while let Some((parent, i)) = path.pop() {
            let mut entries = parent.entries().to_vec();
            let size = child.size();
            if size > self.config.max_size || size < self.config.min_size {
                let (start, count) = if i > 0 {
                    (i - 1, 2)
                } else if i + 1 < entries.len() {
                    (i, 2)
                } else {
                    (i, 1)
                };
                let mut merged: Vec<Entry> = Vec::new();
                for j in start..start + count {
                    if j == i {
                        merged.extend(child.entries().iter().cloned());
                    } else {
                        let sibling = self.get_node(&parent.child_hash(j)?).await?;
                        merged.extend(sibling.entries().iter().cloned());
                    }
                }
                let replacement = self.partition_into_nodes(merged, child.level());
                entries.splice(start..start + count, replacement);
            } else {
                entries[i] = child.parent_entry();
            }
            child = self.new_node(parent.level(), entries);
        }

        let mut root = child;
        if root.size() > self.config.max_size {
            let level = root.level();
            let entries = self.partition_into_nodes(root.entries().to_vec(), level);
            debug!(level = level + 1, children = entries.len(), "split b-tree root");
            root = self.new_node(level + 1, entries);
        }
        self.set_root(root.hash().clone());
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// Under-full nodes are left as they are. Children that become empty are
    /// dropped from their parent, and an internal root with a single child
    /// is replaced by that child.
    pub async fn del(&self, key: &str) -> BTreeResult<bool> {
        let _guard = self.edit_lock.lock().await;
        let (mut path, leaf) = self.descend(key).await?;

        let Ok(found) = search(leaf.entries(), key) else {
            return Ok(false);
        };
        let mut entries = leaf.entries().to_vec();
        entries.remove(found);
        let mut child = self.new_node(0, entries);

        while let Some((parent, i)) = path.pop() {
            let mut entries = parent.entries().to_vec();
            if child.is_empty() {
                entries.remove(i);
            } else {
                entries[i] = child.parent_entry();
            }
            child = self.new_node(parent.level(), entries);
        }

        let mut root = child;
        while !root.is_data() && root.len() == 1 {
            let only = root.child_hash(0)?;
            debug!(from = root.level(), "collapse b-tree root");
            root = self.get_node(&only).await?;
        }
        if root.is_empty() {
            self.set_root(Hash::empty());
        } else {
            self.set_root(root.hash().clone());
        }
        Ok(true)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> BTreeResult<()> {
        let _guard = self.edit_lock.lock().await;
        self.modified.write().expect("lock poisoned").clear();
        self.set_root(Hash::empty());
        Ok(())
    }

    /// Write every edited node reachable from the root as a chunk and
    /// return the new root hash.
    ///
    /// Children are written before their parents. Subtrees that were not
    /// edited keep their hashes. The empty tree is written as an empty data
    /// node so that the returned hash always names a chunk.
    pub async fn flush(&self) -> BTreeResult<Hash> {
        let _guard = self.edit_lock.lock().await;
        let root_hash = self.root_hash();
        let modified = std::mem::take(&mut *self.modified.write().expect("lock poisoned"));

        if root_hash.is_empty() {
            let chunk = self.dag_write.create_chunk(json!([0, []]), Vec::new())?;
            let hash = chunk.hash().clone();
            self.dag_write.put_chunk(chunk).await?;
            return Ok(hash);
        }

        let mut chunks: Vec<(Chunk, Node)> = Vec::new();
        let new_root = self.gather(&root_hash, &modified, &mut chunks)?;

        debug!(chunks = chunks.len(), root = %new_root, "flush b-tree");
        for (chunk, node) in chunks {
            self.dag_write.put_chunk(chunk).await?;
            self.cache
                .lock()
                .expect("lock poisoned")
                .insert(node.hash().clone(), node);
        }
        self.set_root(new_root.clone());
        Ok(new_root)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Walk from the root to the leaf that holds or would hold `key`.
    async fn descend(&self, key: &str) -> BTreeResult<(Vec<(Node, usize)>, Node)> {
        let mut path = Vec::new();
        let mut node = self.get_node(&self.root_hash()).await?;
        while !node.is_data() {
            if node.is_empty() {
                return Err(BTreeError::InvalidNode {
                    hash: node.hash().clone(),
                    reason: "internal node has no children".into(),
                });
            }
            let i = search(node.entries(), key)
                .unwrap_or_else(|i| i)
                .min(node.len() - 1);
            let child = self.get_node(&node.child_hash(i)?).await?;
            path.push((node, i));
            node = child;
        }
        Ok((path, node))
    }

    fn new_node(&self, level: usize, entries: Vec<Entry>) -> Node {
        let node = Node::new(self.temp_hashes.next_hash(), level, entries);
        self.modified
            .write()
            .expect("lock poisoned")
            .insert(node.hash().clone(), node.clone());
        node
    }

    /// Split `entries` into new nodes at `level` and return their parent
    /// entries.
    fn partition_into_nodes(&self, entries: Vec<Entry>, level: usize) -> Vec<Entry> {
        let min = self.config.min_size.saturating_sub(NODE_HEADER_SIZE);
        let max = self.config.max_size.saturating_sub(NODE_HEADER_SIZE);
        partition(entries, Entry::size, min, max)
            .into_iter()
            .map(|part| self.new_node(level, part).parent_entry())
            .collect()
    }

    /// Turn the edited subtree under `hash` into chunks, children first.
    fn gather(
        &self,
        hash: &Hash,
        modified: &HashMap<Hash, Node>,
        out: &mut Vec<(Chunk, Node)>,
    ) -> BTreeResult<Hash> {
        let Some(node) = modified.get(hash) else {
            return Ok(hash.clone());
        };
        if node.is_data() {
            let chunk = self.dag_write.create_chunk(node.to_chunk_data(), Vec::new())?;
            let hash = chunk.hash().clone();
            out.push((chunk, node.with_hash(hash.clone())));
            return Ok(hash);
        }
        let mut entries = Vec::with_capacity(node.len());
        let mut refs = Vec::with_capacity(node.len());
        for (i, entry) in node.entries().iter().enumerate() {
            let child = self.gather(&node.child_hash(i)?, modified, out)?;
            entries.push(Entry::child(entry.key(), &child));
            refs.push(child);
        }
        let rewritten = Node::new(hash.clone(), node.level(), entries);
        let chunk = self.dag_write.create_chunk(rewritten.to_chunk_data(), refs)?;
        let hash = chunk.hash().clone();
        out.push((chunk, rewritten.with_hash(hash.clone())));
        Ok(hash)
    }

    fn set_root(&self, hash: Hash) {
        *self.root_hash.write().expect("lock poisoned") = hash;
    }
}

impl<W: Write + ?Sized> std::fmt::Debug for BTreeWrite<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTreeWrite")
            .field("root_hash", &self.root_hash())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl<W: Write + ?Sized> NodeSource for BTreeWrite<'_, W> {
    async fn get_node(&self, hash: &Hash) -> BTreeResult<Node> {
        let edited = self.modified.read().expect("lock poisoned").get(hash).cloned();
        match edited {
            Some(node) => Ok(node),
            None => load_node(self.dag_write, &self.cache, hash).await,
        }
    }

    fn root_hash(&self) -> Hash {
        self.root_hash.read().expect("lock poisoned").clone()
    }
}
