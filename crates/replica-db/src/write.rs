//! Writes that produce one new commit.

use std::collections::{BTreeMap, BTreeSet};

use replica_btree::{
    all_entries_as_diff, BTreeRead, BTreeWrite, DiffKind, Entry, InternalDiff, NodeSource,
};
use replica_dag::{Read, Write as DagWrite};
use replica_types::{Hash, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commit::{
    commit_from_hash, new_index_change, new_local, new_snapshot, ClientId, Commit, IndexChangeMeta,
    IndexRecord, LocalMeta, Meta, MutationIds, SnapshotMeta,
};
use crate::error::{DbError, DbResult};
use crate::index::{index_value, IndexOperation};

// ---------------------------------------------------------------------------
// Diff configuration
// ---------------------------------------------------------------------------

/// Which index diffs to compute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexSelection {
    All,
    None,
    Only(BTreeSet<String>),
}

/// Which diffs [`Write::commit_with_diffs`] and [`diff_commits`] compute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffConfig {
    /// Diff the primary map.
    pub should_compute_diffs: bool,
    pub should_compute_diffs_for_indexes: IndexSelection,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self::all()
    }
}

impl DiffConfig {
    /// Compute every diff.
    pub fn all() -> Self {
        Self {
            should_compute_diffs: true,
            should_compute_diffs_for_indexes: IndexSelection::All,
        }
    }

    /// Compute nothing.
    pub fn none() -> Self {
        Self {
            should_compute_diffs: false,
            should_compute_diffs_for_indexes: IndexSelection::None,
        }
    }

    pub fn should_compute_diffs_for_index(&self, name: &str) -> bool {
        match &self.should_compute_diffs_for_indexes {
            IndexSelection::All => true,
            IndexSelection::None => false,
            IndexSelection::Only(names) => names.contains(name),
        }
    }
}

/// Diffs keyed by `""` for the primary map and by index name for indexes.
/// Empty diffs are never stored.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DiffsMap(BTreeMap<String, InternalDiff>);

impl DiffsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, diff: InternalDiff) {
        if !diff.is_empty() {
            self.0.insert(key.into(), diff);
        }
    }

    pub fn get(&self, key: &str) -> Option<&InternalDiff> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &InternalDiff)> {
        self.0.iter()
    }
}

/// Diff two commits of the same store: the primary map, then every index
/// selected by `config`. An index on only one side diffs as all adds or all
/// deletes.
pub async fn diff_commits<R: Read + ?Sized>(
    old: &Commit,
    new: &Commit,
    read: &R,
    config: &DiffConfig,
) -> DbResult<DiffsMap> {
    diff_roots(read, old.value_hash(), old.indexes(), new, config).await
}

async fn diff_roots<R: Read + ?Sized>(
    read: &R,
    old_value: &Hash,
    old_indexes: &[IndexRecord],
    new: &Commit,
    config: &DiffConfig,
) -> DbResult<DiffsMap> {
    let mut diffs = DiffsMap::new();
    if config.should_compute_diffs {
        let map = BTreeRead::new(read, new.value_hash().clone());
        diffs.set("", map.diff(old_value).await?);
    }

    let old_by_name: BTreeMap<&str, &IndexRecord> = old_indexes
        .iter()
        .map(|index| (index.definition.name.as_str(), index))
        .collect();
    for index in new.indexes() {
        let name = index.definition.name.as_str();
        if !config.should_compute_diffs_for_index(name) {
            continue;
        }
        let tree = BTreeRead::new(read, index.value_hash.clone());
        let diff = match old_by_name.get(name) {
            Some(old) => tree.diff(&old.value_hash).await?,
            None => all_entries_as_diff(&tree, DiffKind::Add).await?,
        };
        diffs.set(name, diff);
    }
    for old in old_indexes {
        let name = old.definition.name.as_str();
        let kept = new.indexes().iter().any(|i| i.definition.name == name);
        if kept || !config.should_compute_diffs_for_index(name) {
            continue;
        }
        let tree = BTreeRead::new(read, old.value_hash.clone());
        diffs.set(name, all_entries_as_diff(&tree, DiffKind::Del).await?);
    }
    Ok(diffs)
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

struct IndexWrite<'a> {
    record: IndexRecord,
    map: BTreeWrite<'a, dyn DagWrite + 'a>,
}

/// Builds one commit on top of a basis inside a DAG write.
///
/// The primary map and every index are edited as B-trees. [`put_commit`]
/// flushes them and writes the commit chunk; nothing becomes durable until
/// the DAG write itself commits.
///
/// [`put_commit`]: Write::put_commit
pub struct Write<'a> {
    dag_write: &'a (dyn DagWrite + 'a),
    map: BTreeWrite<'a, dyn DagWrite + 'a>,
    basis: Option<Commit>,
    meta: Meta,
    indexes: BTreeMap<String, IndexWrite<'a>>,
    client_id: Option<ClientId>,
}

impl<'a> Write<'a> {
    fn build(
        dag_write: &'a (dyn DagWrite + 'a),
        value_hash: Hash,
        basis: Option<Commit>,
        meta: Meta,
        indexes: &[IndexRecord],
        client_id: Option<ClientId>,
    ) -> Self {
        let indexes = indexes
            .iter()
            .map(|record| {
                let index = IndexWrite {
                    record: record.clone(),
                    map: BTreeWrite::new(dag_write, record.value_hash.clone()),
                };
                (record.definition.name.clone(), index)
            })
            .collect();
        Self {
            dag_write,
            map: BTreeWrite::new(dag_write, value_hash),
            basis,
            meta,
            indexes,
            client_id,
        }
    }

    /// A write for a local mutation of `client_id` on top of `basis_hash`.
    /// The mutation id is the next one the basis expects from that client.
    pub async fn new_local(
        basis_hash: &Hash,
        mutator_name: &str,
        mutator_args_json: Value,
        original_hash: Option<Hash>,
        dag_write: &'a (dyn DagWrite + 'a),
        timestamp: u64,
        client_id: &str,
    ) -> DbResult<Self> {
        let basis = commit_from_hash(basis_hash, dag_write).await?;
        let mutation_id = basis.next_mutation_id(client_id, dag_write).await?;
        let meta = Meta::Local(LocalMeta {
            basis_hash: basis_hash.clone(),
            mutation_id,
            mutator_name: mutator_name.to_owned(),
            mutator_args_json,
            original_hash,
            timestamp,
            client_id: client_id.to_owned(),
        });
        let value_hash = basis.value_hash().clone();
        let indexes = basis.indexes().to_vec();
        let client_id = Some(client_id.to_owned());
        Ok(Self::build(dag_write, value_hash, Some(basis), meta, &indexes, client_id))
    }

    /// A write for a snapshot. Without a basis the map starts empty.
    pub async fn new_snapshot(
        basis_hash: Option<&Hash>,
        last_mutation_ids: MutationIds,
        cookie_json: Value,
        dag_write: &'a (dyn DagWrite + 'a),
        indexes: Vec<IndexRecord>,
    ) -> DbResult<Self> {
        let basis = match basis_hash {
            Some(hash) => Some(commit_from_hash(hash, dag_write).await?),
            None => None,
        };
        let value_hash = basis.as_ref().map_or_else(Hash::empty, |b| b.value_hash().clone());
        let meta = Meta::Snapshot(SnapshotMeta {
            basis_hash: basis_hash.cloned(),
            last_mutation_ids,
            cookie_json,
        });
        Ok(Self::build(dag_write, value_hash, basis, meta, &indexes, None))
    }

    /// A write that replaces the indexes of `basis_hash` with `indexes`,
    /// leaving the primary map untouched.
    pub async fn new_index_change(
        basis_hash: &Hash,
        dag_write: &'a (dyn DagWrite + 'a),
        indexes: Vec<IndexRecord>,
        client_id: &str,
    ) -> DbResult<Self> {
        let basis = commit_from_hash(basis_hash, dag_write).await?;
        let last_mutation_id = basis.mutation_id(client_id, dag_write).await?;
        let meta = Meta::IndexChange(IndexChangeMeta {
            basis_hash: basis_hash.clone(),
            last_mutation_id,
        });
        let value_hash = basis.value_hash().clone();
        Ok(Self::build(
            dag_write,
            value_hash,
            Some(basis),
            meta,
            &indexes,
            Some(client_id.to_owned()),
        ))
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn basis(&self) -> Option<&Commit> {
        self.basis.as_ref()
    }

    pub fn is_local(&self) -> bool {
        matches!(self.meta, Meta::Local(_))
    }

    /// The mutation id of a local write.
    pub fn mutation_id(&self) -> Option<u64> {
        match &self.meta {
            Meta::Local(meta) => Some(meta.mutation_id),
            _ => None,
        }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<Value>> {
        Ok(self.map.get(key).await?)
    }

    pub async fn has(&self, key: &str) -> DbResult<bool> {
        Ok(self.map.has(key).await?)
    }

    pub async fn is_empty(&self) -> DbResult<bool> {
        Ok(self.map.is_empty().await?)
    }

    pub async fn scan(&self, from_key: &str, limit: usize) -> DbResult<Vec<Entry>> {
        Ok(self.map.scan(from_key, limit).await?)
    }

    fn check_mutable(&self) -> DbResult<()> {
        match self.meta {
            Meta::IndexChange(_) => Err(DbError::NotAllowed("editing values in an index change")),
            _ => Ok(()),
        }
    }

    async fn update_indexes(
        &self,
        key: &str,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> DbResult<()> {
        for index in self.indexes.values() {
            let definition = &index.record.definition;
            if !key.starts_with(&definition.key_prefix) {
                continue;
            }
            if let Some(old) = old {
                index_value(&index.map, IndexOperation::Remove, key, old, definition).await?;
            }
            if let Some(new) = new {
                index_value(&index.map, IndexOperation::Add, key, new, definition).await?;
            }
        }
        Ok(())
    }

    pub async fn put(&self, key: &str, value: Value) -> DbResult<()> {
        self.check_mutable()?;
        let old = self.map.get(key).await?;
        self.update_indexes(key, old.as_ref(), Some(&value)).await?;
        self.map.put(key, value).await?;
        Ok(())
    }

    /// Remove `key`. Returns whether it existed.
    pub async fn del(&self, key: &str) -> DbResult<bool> {
        self.check_mutable()?;
        let Some(old) = self.map.get(key).await? else {
            return Ok(false);
        };
        self.update_indexes(key, Some(&old), None).await?;
        Ok(self.map.del(key).await?)
    }

    pub async fn clear(&self) -> DbResult<()> {
        self.check_mutable()?;
        self.map.clear().await?;
        for index in self.indexes.values() {
            index.map.clear().await?;
        }
        Ok(())
    }

    /// Flush the map and indexes and put the commit chunk.
    pub async fn put_commit(&self) -> DbResult<Commit> {
        let value_hash = self.map.flush().await?;
        let mut indexes = Vec::with_capacity(self.indexes.len());
        for index in self.indexes.values() {
            indexes.push(IndexRecord {
                definition: index.record.definition.clone(),
                value_hash: index.map.flush().await?,
            });
        }

        let commit = match &self.meta {
            Meta::Local(meta) => new_local(self.dag_write, meta.clone(), value_hash, indexes)?,
            Meta::Snapshot(meta) => {
                new_snapshot(self.dag_write, meta.clone(), value_hash, indexes)?
            }
            Meta::IndexChange(meta) => {
                if let (Some(basis), Some(client_id)) = (&self.basis, &self.client_id) {
                    let expected = basis.mutation_id(client_id, self.dag_write).await?;
                    if expected != meta.last_mutation_id {
                        return Err(DbError::MutationIdMismatch {
                            expected,
                            actual: meta.last_mutation_id,
                        });
                    }
                    if *basis.value_hash() != value_hash {
                        return Err(DbError::NotAllowed("changing the value in an index change"));
                    }
                }
                new_index_change(self.dag_write, meta.clone(), value_hash, indexes)?
            }
        };
        self.dag_write.put_chunk(commit.chunk().clone()).await?;
        Ok(commit)
    }

    /// Put the commit and point `head_name` at it. The DAG write is left
    /// open.
    pub async fn commit(&self, head_name: &str) -> DbResult<Hash> {
        let commit = self.put_commit().await?;
        self.dag_write.set_head(head_name, commit.hash()).await?;
        debug!(head = %head_name, hash = %commit.hash(), "set head");
        Ok(commit.hash().clone())
    }

    /// Like [`commit`](Self::commit), also returning the diffs from the
    /// basis to the new commit.
    pub async fn commit_with_diffs(
        &self,
        head_name: &str,
        config: &DiffConfig,
    ) -> DbResult<(Hash, DiffsMap)> {
        let commit = self.put_commit().await?;
        let diffs = match &self.basis {
            Some(basis) => diff_commits(basis, &commit, self.dag_write, config).await?,
            None => diff_roots(self.dag_write, &Hash::empty(), &[], &commit, config).await?,
        };
        self.dag_write.set_head(head_name, commit.hash()).await?;
        debug!(head = %head_name, hash = %commit.hash(), diffs = diffs.len(), "set head");
        Ok((commit.hash().clone(), diffs))
    }
}

impl std::fmt::Debug for Write<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Write")
            .field("meta", &self.meta)
            .field("indexes", &self.indexes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::commit::{commit_from_head, IndexDefinition, DEFAULT_HEAD_NAME};
    use crate::index::create_index_btree;
    use replica_btree::InternalDiffOperation;
    use replica_dag::{Store, StoreImpl};
    use replica_kv::MemKvStore;
    use replica_types::fake_hasher;
    use serde_json::json;

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn new_store() -> StoreImpl {
        StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("d0"))
    }

    async fn init_db(w: &dyn DagWrite, indexes: &[IndexDefinition]) -> Hash {
        let mut records = Vec::new();
        for definition in indexes {
            let map = BTreeRead::new(w, Hash::empty());
            records.push(IndexRecord {
                definition: definition.clone(),
                value_hash: create_index_btree(w, &map, definition).await.unwrap(),
            });
        }
        let tx = Write::new_snapshot(None, MutationIds::new(), Value::Null, w, records).await.unwrap();
        tx.commit(DEFAULT_HEAD_NAME).await.unwrap()
    }

    async fn local_put(w: &dyn DagWrite, basis: &Hash, entries: &[(&str, Value)]) -> Hash {
        let tx = Write::new_local(basis, "put", json!({}), None, w, 0, "c1").await.unwrap();
        for (k, v) in entries {
            tx.put(k, v.clone()).await.unwrap();
        }
        tx.commit(DEFAULT_HEAD_NAME).await.unwrap()
    }

    fn by_name() -> IndexDefinition {
        IndexDefinition::new("by-name", "", "/name")
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn local_writes_build_on_the_basis() {
        let store = new_store();
        let w = store.write().await.unwrap();
        let genesis = init_db(&*w, &[]).await;
        let h1 = local_put(&*w, &genesis, &[("a", json!(1)), ("b", json!(2))]).await;

        let tx = Write::new_local(&h1, "put", json!({}), None, &*w, 0, "c1").await.unwrap();
        assert_eq!(tx.mutation_id(), Some(2));
        assert_eq!(tx.get("a").await.unwrap(), Some(json!(1)));
        assert!(tx.del("a").await.unwrap());
        assert!(!tx.del("a").await.unwrap());
        assert!(!tx.has("a").await.unwrap());
        let h2 = tx.commit(DEFAULT_HEAD_NAME).await.unwrap();

        let head = commit_from_head(DEFAULT_HEAD_NAME, &*w).await.unwrap();
        assert_eq!(head.hash(), &h2);
        assert_eq!(head.local_meta().unwrap().mutation_id, 2);
        let map = BTreeRead::new(&*w, head.value_hash().clone());
        assert_eq!(map.keys().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn commit_leaves_the_dag_write_open() {
        let store = new_store();
        {
            let w = store.write().await.unwrap();
            init_db(&*w, &[]).await;
        }
        let r = store.read().await.unwrap();
        assert_eq!(r.get_head(DEFAULT_HEAD_NAME).await.unwrap(), None);
    }

    #[tokio::test]
    async fn indexes_follow_puts_and_dels() {
        let store = new_store();
        let w = store.write().await.unwrap();
        let genesis = init_db(&*w, &[by_name()]).await;
        let h1 = local_put(&*w, &genesis, &[("u1", json!({"name": "ann"})), ("u2", json!({"age": 3}))]).await;

        let tx = Write::new_local(&h1, "put", json!({}), None, &*w, 0, "c1").await.unwrap();
        tx.put("u1", json!({"name": "bob"})).await.unwrap();
        let commit = tx.put_commit().await.unwrap();
        let index = BTreeRead::new(&*w, commit.indexes()[0].value_hash.clone());
        assert_eq!(index.keys().await.unwrap(), vec!["\u{0}bob\u{0}u1"]);

        let tx = Write::new_local(commit.hash(), "del", json!({}), None, &*w, 0, "c1").await.unwrap();
        tx.del("u1").await.unwrap();
        let commit = tx.put_commit().await.unwrap();
        let index = BTreeRead::new(&*w, commit.indexes()[0].value_hash.clone());
        assert!(index.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn index_change_adds_an_index_and_rejects_edits() {
        let store = new_store();
        let w = store.write().await.unwrap();
        let genesis = init_db(&*w, &[]).await;
        let h1 = local_put(&*w, &genesis, &[("u1", json!({"name": "ann"}))]).await;

        let basis = commit_from_hash(&h1, &*w).await.unwrap();
        let map = BTreeRead::new(&*w, basis.value_hash().clone());
        let record = IndexRecord {
            definition: by_name(),
            value_hash: create_index_btree(&*w, &map, &by_name()).await.unwrap(),
        };
        let tx = Write::new_index_change(&h1, &*w, vec![record], "c1").await.unwrap();
        assert!(matches!(tx.put("x", json!(1)).await, Err(DbError::NotAllowed(_))));
        assert!(matches!(tx.clear().await, Err(DbError::NotAllowed(_))));
        let (hash, diffs) = tx.commit_with_diffs(DEFAULT_HEAD_NAME, &DiffConfig::all()).await.unwrap();

        let head = commit_from_hash(&hash, &*w).await.unwrap();
        assert_eq!(head.value_hash(), basis.value_hash());
        assert_eq!(head.mutation_id("c1", &*w).await.unwrap(), 1);
        assert!(diffs.get("").is_none());
        assert_eq!(
            diffs.get("by-name").unwrap(),
            &vec![InternalDiffOperation::Add {
                key: "\u{0}ann\u{0}u1".into(),
                new_value: json!({"name": "ann"}),
            }]
        );
    }

    // ---------------------------------------------------------------
    // Diffs
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn commit_with_diffs_reports_map_and_index_changes() {
        let store = new_store();
        let w = store.write().await.unwrap();
        let genesis = init_db(&*w, &[by_name()]).await;
        let h1 = local_put(&*w, &genesis, &[("a", json!({"name": "x"}))]).await;

        let tx = Write::new_local(&h1, "put", json!({}), None, &*w, 0, "c1").await.unwrap();
        tx.put("b", json!(2)).await.unwrap();
        tx.put("a", json!({"name": "y"})).await.unwrap();
        let (_, diffs) = tx.commit_with_diffs(DEFAULT_HEAD_NAME, &DiffConfig::all()).await.unwrap();
        assert_eq!(diffs.len(), 2);
        assert_eq!(
            diffs.get("").unwrap(),
            &vec![
                InternalDiffOperation::Change {
                    key: "a".into(),
                    old_value: json!({"name": "x"}),
                    new_value: json!({"name": "y"}),
                },
                InternalDiffOperation::Add {
                    key: "b".into(),
                    new_value: json!(2),
                },
            ]
        );
        let keys: Vec<&str> = diffs.get("by-name").unwrap().iter().map(|op| op.key()).collect();
        assert_eq!(keys, vec!["\u{0}x\u{0}a", "\u{0}y\u{0}a"]);

        let tx = Write::new_local(&h1, "put", json!({}), None, &*w, 0, "c1").await.unwrap();
        tx.put("c", json!(3)).await.unwrap();
        let (_, diffs) = tx.commit_with_diffs(DEFAULT_HEAD_NAME, &DiffConfig::none()).await.unwrap();
        assert!(diffs.is_empty());
    }

    #[tokio::test]
    async fn dropped_index_diffs_as_all_deletes() {
        let store = new_store();
        let w = store.write().await.unwrap();
        let genesis = init_db(&*w, &[by_name()]).await;
        let h1 = local_put(&*w, &genesis, &[("a", json!({"name": "x"}))]).await;
        let old = commit_from_hash(&h1, &*w).await.unwrap();

        let tx = Write::new_index_change(&h1, &*w, vec![], "c1").await.unwrap();
        let new = tx.put_commit().await.unwrap();
        let diffs = diff_commits(&old, &new, &*w, &DiffConfig::all()).await.unwrap();
        assert_eq!(
            diffs.get("by-name").unwrap(),
            &vec![InternalDiffOperation::Del {
                key: "\u{0}x\u{0}a".into(),
                old_value: json!({"name": "x"}),
            }]
        );

        let only_other = DiffConfig {
            should_compute_diffs: true,
            should_compute_diffs_for_indexes: IndexSelection::Only(["other".to_string()].into()),
        };
        let diffs = diff_commits(&old, &new, &*w, &only_other).await.unwrap();
        assert!(diffs.is_empty());
    }

    #[test]
    fn diffs_map_skips_empty_diffs() {
        let mut diffs = DiffsMap::new();
        diffs.set("", vec![]);
        assert!(diffs.is_empty());
        diffs.set(
            "idx",
            vec![InternalDiffOperation::Add {
                key: "k".into(),
                new_value: json!(1),
            }],
        );
        assert_eq!(diffs.len(), 1);
        assert_eq!(serde_json::to_value(&diffs).unwrap(), json!({"idx": [{"op": "add", "key": "k", "newValue": 1}]}));
    }
}
