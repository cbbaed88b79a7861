//! Replaying local mutations on top of a new basis.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use replica_dag::Write as DagWrite;
use replica_types::{Hash, Value};
use tracing::error;

use crate::commit::{commit_from_hash, Commit};
use crate::error::{DbError, DbResult};
use crate::write::Write;

/// A named mutation that can be run again against a new basis.
#[async_trait]
pub trait Mutator: Send + Sync {
    async fn mutate(&self, tx: &mut Write<'_>, args: &Value) -> DbResult<()>;
}

/// Registered mutators by name.
pub type MutatorDefs = HashMap<String, Arc<dyn Mutator>>;

/// Run the mutation recorded in `mutation` again on top of `basis` and put
/// the resulting local commit.
///
/// The new commit keeps the mutation's arguments and timestamp, and records
/// `mutation` as its original. Its id must be the next one `basis` expects
/// from `client_id`. A mutator missing from `mutators` yields a commit
/// without changes.
pub async fn rebase_mutation_and_put_commit(
    mutation: &Commit,
    dag_write: &dyn DagWrite,
    basis: &Hash,
    mutators: &MutatorDefs,
    client_id: &str,
) -> DbResult<Commit> {
    let meta = mutation.local_meta().ok_or_else(|| DbError::InvalidCommit {
        hash: mutation.hash().clone(),
        reason: "only local commits can be rebased".into(),
    })?;
    let name = meta.mutator_name.as_str();

    let basis_commit = commit_from_hash(basis, dag_write).await?;
    let expected = basis_commit.next_mutation_id(client_id, dag_write).await?;
    if expected != meta.mutation_id {
        return Err(DbError::MutationIdMismatch {
            expected,
            actual: meta.mutation_id,
        });
    }

    let mut tx = Write::new_local(
        basis,
        name,
        meta.mutator_args_json.clone(),
        Some(mutation.hash().clone()),
        dag_write,
        meta.timestamp,
        client_id,
    )
    .await?;
    match mutators.get(name) {
        Some(mutator) => mutator.mutate(&mut tx, &meta.mutator_args_json).await?,
        None => error!(mutator = %name, "cannot rebase unknown mutator"),
    }
    tx.put_commit().await
}

/// [`rebase_mutation_and_put_commit`], then point `head_name` at the new
/// commit.
pub async fn rebase_mutation_and_commit(
    mutation: &Commit,
    dag_write: &dyn DagWrite,
    basis: &Hash,
    head_name: &str,
    mutators: &MutatorDefs,
    client_id: &str,
) -> DbResult<Hash> {
    let commit =
        rebase_mutation_and_put_commit(mutation, dag_write, basis, mutators, client_id).await?;
    dag_write.set_head(head_name, commit.hash()).await?;
    Ok(commit.hash().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{commit_from_head, MutationIds, DEFAULT_HEAD_NAME};
    use replica_btree::{BTreeRead, NodeSource};
    use replica_dag::{Store, StoreImpl};
    use replica_kv::MemKvStore;
    use replica_types::fake_hasher;
    use serde_json::json;

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    /// Puts `args.value` under `args.key`.
    struct Put;

    #[async_trait]
    impl Mutator for Put {
        async fn mutate(&self, tx: &mut Write<'_>, args: &Value) -> DbResult<()> {
            let key = args["key"].as_str().unwrap_or_default();
            tx.put(key, args["value"].clone()).await
        }
    }

    fn mutators() -> MutatorDefs {
        let put: Arc<dyn Mutator> = Arc::new(Put);
        [("put".to_string(), put)].into()
    }

    async fn snapshot(w: &dyn DagWrite, last: &[(&str, u64)], entries: &[(&str, i64)]) -> Hash {
        let ids: MutationIds = last.iter().map(|(c, id)| (c.to_string(), *id)).collect();
        let tx = Write::new_snapshot(None, ids, json!(1), w, vec![]).await.unwrap();
        for (k, v) in entries {
            tx.put(k, json!(v)).await.unwrap();
        }
        tx.put_commit().await.unwrap().hash().clone()
    }

    async fn mutate(w: &dyn DagWrite, basis: &Hash, name: &str, key: &str, value: i64) -> Commit {
        let args = json!({"key": key, "value": value});
        let mut tx = Write::new_local(basis, name, args.clone(), None, w, 7, "c1").await.unwrap();
        if let Some(m) = mutators().get(name) {
            m.mutate(&mut tx, &args).await.unwrap();
        }
        tx.put_commit().await.unwrap()
    }

    async fn value_keys(w: &dyn DagWrite, commit: &Commit) -> Vec<String> {
        BTreeRead::new(w, commit.value_hash().clone()).keys().await.unwrap()
    }

    // ---------------------------------------------------------------
    // Rebase
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn rebase_replays_onto_a_new_snapshot() {
        let store = StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("e0"));
        let w = store.write().await.unwrap();
        let old = snapshot(&*w, &[], &[]).await;
        let local = mutate(&*w, &old, "put", "a", 1).await;

        let new = snapshot(&*w, &[], &[("s", 0)]).await;
        let rebased = rebase_mutation_and_put_commit(&local, &*w, &new, &mutators(), "c1").await.unwrap();
        let meta = rebased.local_meta().unwrap();
        assert_eq!(meta.basis_hash, new);
        assert_eq!(meta.mutation_id, 1);
        assert_eq!(meta.timestamp, 7);
        assert_eq!(meta.original_hash.as_ref(), Some(local.hash()));
        assert_eq!(meta.mutator_args_json, json!({"key": "a", "value": 1}));
        assert_eq!(value_keys(&*w, &rebased).await, vec!["a", "s"]);

        let head = rebase_mutation_and_commit(&local, &*w, &new, DEFAULT_HEAD_NAME, &mutators(), "c1")
            .await
            .unwrap();
        assert_eq!(commit_from_head(DEFAULT_HEAD_NAME, &*w).await.unwrap().hash(), &head);
    }

    #[tokio::test]
    async fn unknown_mutator_rebases_as_a_no_op() {
        let store = StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("e1"));
        let w = store.write().await.unwrap();
        let old = snapshot(&*w, &[], &[]).await;
        let local = mutate(&*w, &old, "gone", "a", 1).await;
        let new = snapshot(&*w, &[], &[("s", 0)]).await;

        let rebased = rebase_mutation_and_put_commit(&local, &*w, &new, &mutators(), "c1").await.unwrap();
        assert_eq!(rebased.local_meta().unwrap().mutator_name, "gone");
        assert_eq!(value_keys(&*w, &rebased).await, vec!["s"]);
    }

    #[tokio::test]
    async fn mutation_id_must_follow_the_basis() {
        let store = StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("e2"));
        let w = store.write().await.unwrap();
        let old = snapshot(&*w, &[], &[]).await;
        let local = mutate(&*w, &old, "put", "a", 1).await;
        let ahead = snapshot(&*w, &[("c1", 1)], &[]).await;

        let err = rebase_mutation_and_put_commit(&local, &*w, &ahead, &mutators(), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::MutationIdMismatch { expected: 2, actual: 1 }));

        let snapshot_commit = commit_from_hash(&old, &*w).await.unwrap();
        assert!(matches!(
            rebase_mutation_and_put_commit(&snapshot_commit, &*w, &ahead, &mutators(), "c1").await,
            Err(DbError::InvalidCommit { .. })
        ));
    }
}
