//! Moving the memory store's state into the durable store.

use std::cmp::Ordering;
use std::collections::HashMap;

use replica_dag::util::{assert_no_missing_chunks, assert_none_present};
use replica_dag::{walk, Chunk, LazyStore, Read, Store, Write};
use replica_db::{
    base_snapshot_from_commit, commit_from_hash, commit_from_head, compare_cookies_for_snapshots,
    local_mutations, local_mutations_greater_than, rebase_mutation_and_put_commit, Commit,
    MutationIds, MutatorDefs, DEFAULT_HEAD_NAME,
};
use replica_types::Hash;
use tracing::debug;

use crate::client_groups::{
    get_client_group, set_client_group, ClientGroup, ClientGroupId, CLIENT_GROUPS_HEAD_NAME,
};
use crate::clients::{assert_has_client_state, get_client_group_id_for_client};
use crate::error::{PersistError, PersistResult};
use crate::gather::{GatherMemdagVisitor, RestrictVisitor};

/// Cancellation check, consulted before every transaction.
pub type Closed<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// Persist the memdag of `client_id` into `perdag`.
///
/// When the memdag's base snapshot is newer than the group's durable one,
/// its memory-only chunks are written to `perdag`, the group's pending
/// mutations are rebased onto it, and the memdag's own pending mutations
/// follow. Otherwise only the memdag's pending mutations that the group has
/// not seen yet are rebased onto the durable head.
///
/// Returns without changes once `closed` reports true.
pub async fn persist(
    client_id: &str,
    memdag: &LazyStore,
    perdag: &dyn Store,
    mutators: &MutatorDefs,
    closed: Closed<'_>,
) -> PersistResult<()> {
    if closed() {
        return Ok(());
    }

    let durable = {
        let read = perdag.read().await?;
        DurableState::load(client_id, &*read).await?
    };
    if closed() {
        return Ok(());
    }

    let limits: MutationIds = [(client_id.to_owned(), durable.last_mutation_id)].into();
    let (new_mutations, memdag_base, candidates) = {
        let read = memdag.lazy_read().await;
        let head = commit_from_head(DEFAULT_HEAD_NAME, &read).await?;
        let new_mutations = local_mutations_greater_than(&head, &limits, &read).await?;
        let memdag_base = base_snapshot_from_commit(&head, &read).await?;
        let newer = compare_cookies_for_snapshots(&memdag_base, &durable.base_snapshot)?;
        if newer == Ordering::Greater {
            let mut visitor = GatherMemdagVisitor::new(&read, durable.head_hash.clone());
            walk(&read, memdag_base.hash(), &mut visitor).await?;
            (new_mutations, Some(memdag_base), visitor.into_gathered())
        } else {
            (new_mutations, None, HashMap::new())
        }
    };
    if closed() {
        return Ok(());
    }

    // Only memory-only chunks are loaded here, so the memdag read never
    // opens a second read of the perdag.
    let gathered = match &memdag_base {
        Some(base) if !candidates.is_empty() => {
            let read = memdag.lazy_read().await;
            let perdag_read = perdag.read().await?;
            let mut restrict = RestrictVisitor::new(&*perdag_read, &candidates);
            walk(&read, base.hash(), &mut restrict).await?;
            restrict.into_restricted()
        }
        _ => candidates,
    };
    debug!(
        client = %client_id,
        mutations = new_mutations.len(),
        chunks = gathered.len(),
        snapshot = memdag_base.is_some(),
        "persist gathered",
    );
    if closed() {
        return Ok(());
    }

    match memdag_base {
        Some(memdag_base) => {
            let persisted = persist_snapshot(
                perdag,
                &durable,
                &memdag_base,
                &gathered,
                &new_mutations,
                mutators,
            )
            .await?;
            if persisted {
                let hashes: Vec<Hash> = {
                    let read = perdag.read().await?;
                    let mut present = Vec::with_capacity(gathered.len());
                    for hash in gathered.keys() {
                        if read.has_chunk(hash).await? {
                            present.push(hash.clone());
                        }
                    }
                    present
                };
                memdag.chunks_persisted(&hashes).await;
            }
        }
        None => {
            debug!(client = %client_id, "memdag snapshot not newer, persisting mutations only");
            let write = perdag.write().await?;
            let group = get_client_group(&durable.client_group_id, &*write)
                .await?
                .ok_or_else(|| PersistError::ClientGroupNotFound(durable.client_group_id.clone()))?;
            assert_no_missing_chunks(&*write, &group.head_hash).await?;
            let mut mutation_ids = group.mutation_ids.clone();
            let head_hash = rebase(
                &new_mutations,
                group.head_hash.clone(),
                &*write,
                mutators,
                &mut mutation_ids,
            )
            .await?;
            set_client_group(
                &durable.client_group_id,
                advance_group(group, head_hash, mutation_ids, None),
                &*write,
            )
            .await?;
            write.commit().await?;
        }
    }
    Ok(())
}

/// What the durable store knew about the client's group at the start.
struct DurableState {
    client_group_id: ClientGroupId,
    head_hash: Hash,
    base_snapshot: Commit,
    last_mutation_id: u64,
    client_groups_head: Option<Hash>,
}

impl DurableState {
    async fn load<R: Read + ?Sized>(client_id: &str, read: &R) -> PersistResult<Self> {
        assert_has_client_state(client_id, read).await?;
        let client_group_id = get_client_group_id_for_client(client_id, read)
            .await?
            .ok_or_else(|| PersistError::ClientStateNotFound(client_id.to_owned()))?;
        let group = get_client_group(&client_group_id, read)
            .await?
            .ok_or_else(|| PersistError::ClientGroupNotFound(client_group_id.clone()))?;
        let head = commit_from_hash(&group.head_hash, read).await?;
        Ok(Self {
            last_mutation_id: head.mutation_id(client_id, read).await?,
            base_snapshot: base_snapshot_from_commit(&head, read).await?,
            client_groups_head: read.get_head(CLIENT_GROUPS_HEAD_NAME).await?,
            head_hash: group.head_hash,
            client_group_id,
        })
    }
}

/// Write the gathered chunks and rebase onto the memdag snapshot. Returns
/// whether anything was committed.
async fn persist_snapshot(
    perdag: &dyn Store,
    durable: &DurableState,
    memdag_base: &Commit,
    gathered: &HashMap<Hash, Chunk>,
    new_mutations: &[Commit],
    mutators: &MutatorDefs,
) -> PersistResult<bool> {
    let write = perdag.write().await?;
    if write.get_head(CLIENT_GROUPS_HEAD_NAME).await? != durable.client_groups_head {
        debug!("client groups changed while gathering, aborting persist");
        return Ok(false);
    }
    assert_none_present(&*write, gathered.keys()).await?;

    let group = get_client_group(&durable.client_group_id, &*write)
        .await?
        .ok_or_else(|| PersistError::ClientGroupNotFound(durable.client_group_id.clone()))?;
    assert_no_missing_chunks(&*write, &group.head_hash).await?;
    let latest_head = commit_from_hash(&group.head_hash, &*write).await?;
    let latest_base = base_snapshot_from_commit(&latest_head, &*write).await?;

    for chunk in gathered.values() {
        write.put_chunk(chunk.clone()).await?;
    }
    assert_no_missing_chunks(&*write, memdag_base.hash()).await?;

    let (mut head_hash, mut mutation_ids, last_server_ackd) =
        if compare_cookies_for_snapshots(memdag_base, &latest_base)? == Ordering::Greater {
            debug!(snapshot = %memdag_base.hash(), "persisting newer snapshot");
            let acked = memdag_base
                .snapshot_meta()
                .map(|meta| meta.last_mutation_ids.clone())
                .unwrap_or_default();
            let mut mutation_ids = acked.clone();
            let pending = local_mutations(&group.head_hash, &*write).await?;
            let basis = memdag_base.hash().clone();
            let head_hash = rebase(&pending, basis, &*write, mutators, &mut mutation_ids).await?;
            (head_hash, mutation_ids, Some(acked))
        } else {
            debug!("durable snapshot advanced concurrently, persisting mutations only");
            (group.head_hash.clone(), group.mutation_ids.clone(), None)
        };
    head_hash = rebase(new_mutations, head_hash, &*write, mutators, &mut mutation_ids).await?;

    set_client_group(
        &durable.client_group_id,
        advance_group(group, head_hash, mutation_ids, last_server_ackd),
        &*write,
    )
    .await?;
    write.commit().await?;
    Ok(true)
}

fn advance_group(
    group: ClientGroup,
    head_hash: Hash,
    mutation_ids: MutationIds,
    last_server_ackd: Option<MutationIds>,
) -> ClientGroup {
    ClientGroup {
        head_hash,
        mutation_ids,
        last_server_ackd_mutation_ids: last_server_ackd
            .unwrap_or(group.last_server_ackd_mutation_ids),
        ..group
    }
}

/// Rebase `mutations` (head first) oldest first onto `basis`, skipping those
/// already part of the chain. Records each rebased id in `mutation_ids`.
async fn rebase(
    mutations: &[Commit],
    mut basis: Hash,
    write: &dyn Write,
    mutators: &MutatorDefs,
    mutation_ids: &mut MutationIds,
) -> PersistResult<Hash> {
    for mutation in mutations.iter().rev() {
        let Some(meta) = mutation.local_meta() else {
            continue;
        };
        let head = commit_from_hash(&basis, write).await?;
        if meta.mutation_id <= head.mutation_id(&meta.client_id, write).await? {
            continue;
        }
        mutation_ids.insert(meta.client_id.clone(), meta.mutation_id);
        let rebased =
            rebase_mutation_and_put_commit(mutation, write, &basis, mutators, &meta.client_id)
                .await?;
        basis = rebased.hash().clone();
    }
    Ok(basis)
}
