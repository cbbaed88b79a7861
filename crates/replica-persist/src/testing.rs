//! Fixtures shared by the protocol tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use replica_btree::{BTreeRead, NodeSource};
use replica_dag::{LazyStore, LazyStoreConfig, Read, Store, StoreImpl, Write};
use replica_db::{
    commit_from_hash, commit_from_head, Commit, DbError, DbResult, Mutator, MutatorDefs,
    Write as DbWrite, DEFAULT_HEAD_NAME,
};
use replica_kv::MemKvStore;
use replica_types::{fake_hasher, Hash, Value};
use serde_json::json;

use crate::clients::{init_client, InitClient};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Puts `args.value` under `args.key`.
struct Put;

#[async_trait]
impl Mutator for Put {
    async fn mutate(&self, tx: &mut DbWrite<'_>, args: &Value) -> DbResult<()> {
        let key = args["key"].as_str().unwrap_or_default();
        tx.put(key, args["value"].clone()).await
    }
}

pub fn mutators() -> MutatorDefs {
    let put: Arc<dyn Mutator> = Arc::new(Put);
    [("put".to_string(), put)].into()
}

/// Rejects every replay.
struct Fail;

#[async_trait]
impl Mutator for Fail {
    async fn mutate(&self, _tx: &mut DbWrite<'_>, _args: &Value) -> DbResult<()> {
        Err(DbError::NotAllowed("replaying this mutation"))
    }
}

/// Mutators under the same names as [`mutators`] that all fail.
pub fn failing_mutators() -> MutatorDefs {
    let fail: Arc<dyn Mutator> = Arc::new(Fail);
    [("put".to_string(), fail)].into()
}

pub fn never_closed() -> bool {
    false
}

/// A `closed` check that reports open for the first `open_checks` calls.
pub fn closed_after(open_checks: usize) -> impl Fn() -> bool + Send + Sync {
    let calls = AtomicUsize::new(0);
    move || calls.fetch_add(1, Ordering::SeqCst) >= open_checks
}

pub fn new_perdag(prefix: &str) -> Arc<StoreImpl> {
    Arc::new(StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher(prefix)))
}

pub async fn new_client(perdag: &Arc<StoreImpl>) -> InitClient {
    init_client(&**perdag, &["put".to_string()], &BTreeMap::new(), 0)
        .await
        .unwrap()
}

/// A memdag over `perdag` whose main head is the client's durable head.
pub async fn new_memdag(perdag: &Arc<StoreImpl>, client: &InitClient, prefix: &str) -> LazyStore {
    let source: Arc<dyn Store> = perdag.clone();
    let memdag = LazyStore::new(source, &LazyStoreConfig::default(), fake_hasher(prefix));
    let w = memdag.lazy_write().await;
    w.set_head(DEFAULT_HEAD_NAME, &client.client.head_hash).await.unwrap();
    w.commit().await.unwrap();
    drop(w);
    memdag
}

/// Run the `put` mutator for `client_id` on the memdag head.
pub async fn put(memdag: &LazyStore, client_id: &str, key: &str, value: i64) -> Commit {
    let w = memdag.lazy_write().await;
    let head = commit_from_head(DEFAULT_HEAD_NAME, &w).await.unwrap();
    let args = json!({"key": key, "value": value});
    let mut tx = DbWrite::new_local(head.hash(), "put", args.clone(), None, &w, 1, client_id)
        .await
        .unwrap();
    mutators()["put"].mutate(&mut tx, &args).await.unwrap();
    let hash = tx.commit(DEFAULT_HEAD_NAME).await.unwrap();
    let commit = commit_from_hash(&hash, &w).await.unwrap();
    w.commit().await.unwrap();
    commit
}

/// Replace the memdag head with a snapshot on top of it that carries
/// `cookie` and the current values plus `entries`.
pub async fn pull_snapshot(memdag: &LazyStore, cookie: Value, entries: &[(&str, i64)]) -> Hash {
    let w = memdag.lazy_write().await;
    let head = commit_from_head(DEFAULT_HEAD_NAME, &w).await.unwrap();
    let tx = DbWrite::new_snapshot(Some(head.hash()), BTreeMap::new(), cookie, &w, vec![])
        .await
        .unwrap();
    for (key, value) in entries {
        tx.put(key, json!(value)).await.unwrap();
    }
    let hash = tx.commit(DEFAULT_HEAD_NAME).await.unwrap();
    w.commit().await.unwrap();
    hash
}

pub async fn keys<R: Read + ?Sized>(read: &R, commit: &Commit) -> Vec<String> {
    BTreeRead::new(read, commit.value_hash().clone()).keys().await.unwrap()
}
