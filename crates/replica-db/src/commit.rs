//! Commits and the chain of bases behind them.
//!
//! A commit is a chunk whose data is `{meta, valueHash, indexes}`. Following
//! `meta.basisHash` from any commit eventually reaches a snapshot, the base
//! snapshot of that commit.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use replica_dag::{Chunk, Read, Write};
use replica_types::{Hash, Value};
use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Head the main commit chain hangs off.
pub const DEFAULT_HEAD_NAME: &str = "main";

pub type ClientId = String;

/// Last applied mutation id per client.
pub type MutationIds = BTreeMap<ClientId, u64>;

// ---------------------------------------------------------------------------
// Meta
// ---------------------------------------------------------------------------

/// What kind of commit this is, and how it relates to its basis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Meta {
    Local(LocalMeta),
    Snapshot(SnapshotMeta),
    IndexChange(IndexChangeMeta),
}

/// A mutation applied locally and not yet confirmed by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMeta {
    pub basis_hash: Hash,
    #[serde(rename = "mutationID")]
    pub mutation_id: u64,
    pub mutator_name: String,
    #[serde(rename = "mutatorArgsJSON")]
    pub mutator_args_json: Value,
    /// The commit this one was rebased from. A weak reference.
    pub original_hash: Option<Hash>,
    pub timestamp: u64,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
}

/// A server-confirmed checkpoint. The genesis snapshot has no basis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// A weak reference: the basis of a snapshot may be collected.
    pub basis_hash: Option<Hash>,
    #[serde(rename = "lastMutationIDs")]
    pub last_mutation_ids: MutationIds,
    #[serde(rename = "cookieJSON")]
    pub cookie_json: Value,
}

/// A commit that only adds or drops secondary indexes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexChangeMeta {
    pub basis_hash: Hash,
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
}

impl Meta {
    /// The basis this commit was built on, if any.
    pub fn basis_hash(&self) -> Option<&Hash> {
        match self {
            Self::Local(meta) => Some(&meta.basis_hash),
            Self::Snapshot(meta) => meta.basis_hash.as_ref(),
            Self::IndexChange(meta) => Some(&meta.basis_hash),
        }
    }
}

// ---------------------------------------------------------------------------
// Commit data
// ---------------------------------------------------------------------------

/// Definition of a secondary index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub name: String,
    /// Only primary keys starting with this prefix are indexed.
    #[serde(default)]
    pub key_prefix: String,
    pub json_pointer: String,
    /// Skip values the pointer does not select instead of failing.
    #[serde(default)]
    pub allow_empty: bool,
}

impl IndexDefinition {
    pub fn new(
        name: impl Into<String>,
        key_prefix: impl Into<String>,
        json_pointer: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            key_prefix: key_prefix.into(),
            json_pointer: json_pointer.into(),
            allow_empty: false,
        }
    }

    pub fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }
}

/// A secondary index and the root of its B-tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub definition: IndexDefinition,
    pub value_hash: Hash,
}

/// The data of a commit chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitData {
    pub meta: Meta,
    pub value_hash: Hash,
    pub indexes: Vec<IndexRecord>,
}

impl CommitData {
    /// Strong refs of the commit chunk, history first: the basis (except for
    /// snapshots), the value tree, then the index trees.
    pub fn refs(&self) -> Vec<Hash> {
        let basis = match &self.meta {
            Meta::Local(meta) => Some(&meta.basis_hash),
            Meta::IndexChange(meta) => Some(&meta.basis_hash),
            Meta::Snapshot(_) => None,
        };
        basis
            .into_iter()
            .chain(Some(&self.value_hash))
            .chain(self.indexes.iter().map(|index| &index.value_hash))
            .filter(|hash| !hash.is_empty())
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// A parsed commit chunk. Cloning is cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    chunk: Chunk,
    data: Arc<CommitData>,
}

impl Commit {
    /// Parse a commit out of `chunk`.
    pub fn from_chunk(chunk: Chunk) -> DbResult<Self> {
        let hash = chunk.hash().clone();
        let meta = &chunk.data()["meta"];
        let needs_basis = matches!(meta["type"].as_str(), Some("local" | "indexChange"));
        if needs_basis && meta["basisHash"].is_null() {
            return Err(DbError::NoBasis(hash));
        }
        let data: CommitData =
            serde_json::from_value(chunk.data().clone()).map_err(|err| DbError::InvalidCommit {
                hash: hash.clone(),
                reason: err.to_string(),
            })?;
        let mut names = HashSet::new();
        for index in &data.indexes {
            if !names.insert(index.definition.name.as_str()) {
                return Err(DbError::InvalidCommit {
                    hash,
                    reason: format!("duplicate index {}", index.definition.name),
                });
            }
        }
        if let Meta::Local(local) = &data.meta {
            if local.mutator_name.is_empty() {
                return Err(DbError::InvalidCommit {
                    hash,
                    reason: "empty mutator name".into(),
                });
            }
        }
        Ok(Self {
            chunk,
            data: Arc::new(data),
        })
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn hash(&self) -> &Hash {
        self.chunk.hash()
    }

    pub fn meta(&self) -> &Meta {
        &self.data.meta
    }

    pub fn value_hash(&self) -> &Hash {
        &self.data.value_hash
    }

    pub fn indexes(&self) -> &[IndexRecord] {
        &self.data.indexes
    }

    pub fn basis_hash(&self) -> Option<&Hash> {
        self.data.meta.basis_hash()
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self.data.meta, Meta::Snapshot(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.data.meta, Meta::Local(_))
    }

    pub fn local_meta(&self) -> Option<&LocalMeta> {
        match &self.data.meta {
            Meta::Local(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn snapshot_meta(&self) -> Option<&SnapshotMeta> {
        match &self.data.meta {
            Meta::Snapshot(meta) => Some(meta),
            _ => None,
        }
    }

    /// Last mutation id of `client_id` applied at this commit.
    pub async fn mutation_id<R: Read + ?Sized>(&self, client_id: &str, read: &R) -> DbResult<u64> {
        get_mutation_id(client_id, read, self.meta()).await
    }

    /// The id the next mutation of `client_id` on top of this commit gets.
    pub async fn next_mutation_id<R: Read + ?Sized>(
        &self,
        client_id: &str,
        read: &R,
    ) -> DbResult<u64> {
        Ok(self.mutation_id(client_id, read).await? + 1)
    }
}

fn new_commit<W: Write + ?Sized>(dag_write: &W, data: CommitData) -> DbResult<Commit> {
    let refs = data.refs();
    let chunk = dag_write.create_chunk(serde_json::to_value(&data)?, refs)?;
    Ok(Commit {
        chunk,
        data: Arc::new(data),
    })
}

/// Create (but do not put) a local commit chunk.
pub fn new_local<W: Write + ?Sized>(
    dag_write: &W,
    meta: LocalMeta,
    value_hash: Hash,
    indexes: Vec<IndexRecord>,
) -> DbResult<Commit> {
    new_commit(
        dag_write,
        CommitData {
            meta: Meta::Local(meta),
            value_hash,
            indexes,
        },
    )
}

/// Create (but do not put) a snapshot commit chunk.
pub fn new_snapshot<W: Write + ?Sized>(
    dag_write: &W,
    meta: SnapshotMeta,
    value_hash: Hash,
    indexes: Vec<IndexRecord>,
) -> DbResult<Commit> {
    new_commit(
        dag_write,
        CommitData {
            meta: Meta::Snapshot(meta),
            value_hash,
            indexes,
        },
    )
}

/// Create (but do not put) an index change commit chunk.
pub fn new_index_change<W: Write + ?Sized>(
    dag_write: &W,
    meta: IndexChangeMeta,
    value_hash: Hash,
    indexes: Vec<IndexRecord>,
) -> DbResult<Commit> {
    new_commit(
        dag_write,
        CommitData {
            meta: Meta::IndexChange(meta),
            value_hash,
            indexes,
        },
    )
}

// ---------------------------------------------------------------------------
// Chain walking
// ---------------------------------------------------------------------------

pub async fn commit_from_hash<R: Read + ?Sized>(hash: &Hash, read: &R) -> DbResult<Commit> {
    let chunk = read.must_get_chunk(hash).await?;
    Commit::from_chunk(chunk)
}

pub async fn commit_from_head<R: Read + ?Sized>(name: &str, read: &R) -> DbResult<Commit> {
    let hash = read
        .get_head(name)
        .await?
        .ok_or_else(|| DbError::MissingHead(name.to_owned()))?;
    commit_from_hash(&hash, read).await
}

fn basis_of(commit: &Commit) -> DbResult<&Hash> {
    commit
        .basis_hash()
        .ok_or_else(|| DbError::NoBasis(commit.hash().clone()))
}

/// Commits from `from` back to and including its base snapshot, head first.
pub async fn commit_chain<R: Read + ?Sized>(from: &Hash, read: &R) -> DbResult<Vec<Commit>> {
    let mut commit = commit_from_hash(from, read).await?;
    let mut chain = Vec::new();
    while !commit.is_snapshot() {
        let basis = basis_of(&commit)?.clone();
        chain.push(commit);
        commit = commit_from_hash(&basis, read).await?;
    }
    chain.push(commit);
    Ok(chain)
}

/// The local commits in the chain of `from`, head first.
pub async fn local_mutations<R: Read + ?Sized>(from: &Hash, read: &R) -> DbResult<Vec<Commit>> {
    let chain = commit_chain(from, read).await?;
    Ok(chain.into_iter().filter(Commit::is_local).collect())
}

/// Local commits in the chain of `commit` whose mutation id is above the
/// limit recorded for their client, head first.
///
/// Commits of clients without a limit are skipped. The walk ends at the base
/// snapshot or once every client has reached its limit.
pub async fn local_mutations_greater_than<R: Read + ?Sized>(
    commit: &Commit,
    limits: &MutationIds,
    read: &R,
) -> DbResult<Vec<Commit>> {
    let mut remaining = limits.clone();
    let mut out = Vec::new();
    let mut commit = commit.clone();
    while !commit.is_snapshot() && !remaining.is_empty() {
        if let Some(local) = commit.local_meta() {
            if let Some(&limit) = remaining.get(&local.client_id) {
                if local.mutation_id <= limit {
                    remaining.remove(&local.client_id);
                } else {
                    out.push(commit.clone());
                }
            }
        }
        let basis = basis_of(&commit)?.clone();
        commit = commit_from_hash(&basis, read).await?;
    }
    Ok(out)
}

pub async fn base_snapshot_from_hash<R: Read + ?Sized>(hash: &Hash, read: &R) -> DbResult<Commit> {
    let commit = commit_from_hash(hash, read).await?;
    base_snapshot_from_commit(&commit, read).await
}

pub async fn base_snapshot_from_head<R: Read + ?Sized>(name: &str, read: &R) -> DbResult<Commit> {
    let commit = commit_from_head(name, read).await?;
    base_snapshot_from_commit(&commit, read).await
}

pub async fn base_snapshot_from_commit<R: Read + ?Sized>(
    commit: &Commit,
    read: &R,
) -> DbResult<Commit> {
    let mut commit = commit.clone();
    while !commit.is_snapshot() {
        let basis = basis_of(&commit)?.clone();
        commit = commit_from_hash(&basis, read).await?;
    }
    Ok(commit)
}

/// Last mutation id of `client_id` as of the commit carrying `meta`.
///
/// A snapshot answers from its `lastMutationIDs` (0 when the client is
/// absent). A local commit of the same client answers with its own id. Any
/// other commit defers to its basis.
pub async fn get_mutation_id<R: Read + ?Sized>(
    client_id: &str,
    read: &R,
    meta: &Meta,
) -> DbResult<u64> {
    let mut basis = match meta {
        Meta::Snapshot(snapshot) => {
            return Ok(snapshot.last_mutation_ids.get(client_id).copied().unwrap_or(0));
        }
        Meta::Local(local) if local.client_id == client_id => return Ok(local.mutation_id),
        Meta::Local(local) => local.basis_hash.clone(),
        Meta::IndexChange(change) => change.basis_hash.clone(),
    };
    loop {
        let commit = commit_from_hash(&basis, read).await?;
        basis = match commit.meta() {
            Meta::Snapshot(snapshot) => {
                return Ok(snapshot.last_mutation_ids.get(client_id).copied().unwrap_or(0))
            }
            Meta::Local(local) if local.client_id == client_id => return Ok(local.mutation_id),
            Meta::Local(local) => local.basis_hash.clone(),
            Meta::IndexChange(change) => change.basis_hash.clone(),
        };
    }
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

enum CookieOrder<'a> {
    Number(f64),
    Str(&'a str),
}

fn cookie_order(cookie: &Value) -> Option<CookieOrder<'_>> {
    match cookie {
        Value::Number(n) => n.as_f64().map(CookieOrder::Number),
        Value::String(s) => Some(CookieOrder::Str(s)),
        Value::Object(map) => match map.get("order")? {
            Value::Number(n) => n.as_f64().map(CookieOrder::Number),
            Value::String(s) => Some(CookieOrder::Str(s)),
            _ => None,
        },
        _ => None,
    }
}

/// Order two sync cookies.
///
/// `null` sorts first. Numbers compare numerically, strings by bytes, and
/// objects by their `order` field. Anything else is a [`CookieMismatch`].
///
/// [`CookieMismatch`]: DbError::CookieMismatch
pub fn compare_cookies(a: &Value, b: &Value) -> DbResult<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => return Ok(Ordering::Equal),
        (Value::Null, _) => return Ok(Ordering::Less),
        (_, Value::Null) => return Ok(Ordering::Greater),
        _ => {}
    }
    match (cookie_order(a), cookie_order(b)) {
        (Some(CookieOrder::Number(x)), Some(CookieOrder::Number(y))) => Ok(x.total_cmp(&y)),
        (Some(CookieOrder::Str(x)), Some(CookieOrder::Str(y))) => Ok(x.cmp(y)),
        _ => Err(DbError::CookieMismatch {
            a: a.clone(),
            b: b.clone(),
        }),
    }
}

/// Order two snapshot commits by cookie.
pub fn compare_cookies_for_snapshots(a: &Commit, b: &Commit) -> DbResult<Ordering> {
    fn cookie(commit: &Commit) -> DbResult<&Value> {
        commit
            .snapshot_meta()
            .map(|meta| &meta.cookie_json)
            .ok_or_else(|| DbError::InvalidCommit {
                hash: commit.hash().clone(),
                reason: "expected a snapshot".into(),
            })
    }
    compare_cookies(cookie(a)?, cookie(b)?)
}
