//! Pulling a newer durable state into the memory store.

use std::cmp::Ordering;

use replica_dag::{default_chunk_sizer, walk, Chunk, LazyStore, Store, Write};
use replica_db::{
    base_snapshot_from_commit, base_snapshot_from_hash, base_snapshot_from_head, commit_from_hash,
    commit_from_head, compare_cookies_for_snapshots, diff_commits, local_mutations_greater_than,
    rebase_mutation_and_put_commit, Commit, DiffConfig, DiffsMap, MutationIds, MutatorDefs,
    DEFAULT_HEAD_NAME,
};
use replica_types::Hash;
use tracing::{debug, warn};

use crate::clients::{get_client_group_for_client, must_get_client, set_client, Client};
use crate::config::RefreshConfig;
use crate::error::{PersistError, PersistResult};
use crate::gather::GatherNotCachedVisitor;
use crate::persist::Closed;

/// Whether refreshing from a durable head is pointless: the memdag already
/// has a newer snapshot, or the same snapshot with no durable mutations on
/// top of it.
pub fn should_abort_refresh(
    memdag_base: &Commit,
    perdag_base: &Commit,
    perdag_head: &Hash,
) -> PersistResult<bool> {
    let cmp = compare_cookies_for_snapshots(memdag_base, perdag_base)?;
    Ok(cmp == Ordering::Greater || (cmp == Ordering::Equal && perdag_head == perdag_base.hash()))
}

/// What the perdag phase hands to the memdag phase.
struct Pulled {
    perdag_head: Hash,
    last_mutation_id: u64,
    chunks: Vec<(Chunk, usize)>,
}

/// Replace the memdag head of `client_id` with the group's durable head,
/// rebasing the memdag's own pending mutations on top.
///
/// Returns the new memdag head and the diffs from the old one, or `None`
/// when there was nothing newer to pull or `closed` reported true.
///
/// While the refresh runs, the client record's `temp_refresh_hash` keeps the
/// durable head alive and the memdag defers cache evictions.
pub async fn refresh(
    memdag: &LazyStore,
    perdag: &dyn Store,
    client_id: &str,
    mutators: &MutatorDefs,
    diff_config: &DiffConfig,
    closed: Closed<'_>,
    config: &RefreshConfig,
) -> PersistResult<Option<(Hash, DiffsMap)>> {
    if closed() {
        return Ok(None);
    }
    let memdag_base = {
        let read = memdag.lazy_read().await;
        base_snapshot_from_head(DEFAULT_HEAD_NAME, &read).await?
    };
    if closed() {
        return Ok(None);
    }

    let outcome = memdag
        .with_suspended_source_cache_evicts_and_deletes(pull_and_rebase(
            memdag,
            perdag,
            client_id,
            mutators,
            diff_config,
            closed,
            config,
            &memdag_base,
        ))
        .await;
    let refreshed = match outcome {
        Ok(refreshed) => refreshed,
        Err(err) => {
            if !err.is_client_state_not_found() && !closed() {
                if let Err(cleanup) = finish_refresh(perdag, client_id, None).await {
                    warn!(client = %client_id, error = %cleanup, "failed to clear refresh hash");
                }
            }
            return Err(err);
        }
    };
    if closed() {
        return Ok(None);
    }

    // Also runs when the memdag phase aborted: the client must not keep the
    // pulled head alive past this refresh.
    let perdag_head = refreshed.as_ref().map(|(_, _, perdag_head)| perdag_head.clone());
    finish_refresh(perdag, client_id, perdag_head).await?;
    Ok(refreshed.map(|(head, diffs, _)| (head, diffs)))
}

#[allow(clippy::too_many_arguments)]
async fn pull_and_rebase(
    memdag: &LazyStore,
    perdag: &dyn Store,
    client_id: &str,
    mutators: &MutatorDefs,
    diff_config: &DiffConfig,
    closed: Closed<'_>,
    config: &RefreshConfig,
    memdag_base: &Commit,
) -> PersistResult<Option<(Hash, DiffsMap, Hash)>> {
    let Some(pulled) = pull(memdag, perdag, client_id, memdag_base, config).await? else {
        return Ok(None);
    };
    if closed() {
        return Ok(None);
    }
    tokio::time::sleep(config.delay).await;
    if closed() {
        return Ok(None);
    }
    rebase_memdag(memdag, client_id, mutators, diff_config, pulled).await
}

/// Record the refresh on the client and gather the durable chunks the
/// memdag is missing.
async fn pull(
    memdag: &LazyStore,
    perdag: &dyn Store,
    client_id: &str,
    memdag_base: &Commit,
    config: &RefreshConfig,
) -> PersistResult<Option<Pulled>> {
    let write = perdag.write().await?;
    let group = get_client_group_for_client(client_id, &*write)
        .await?
        .ok_or_else(|| PersistError::ClientStateNotFound(client_id.to_owned()))?;
    let perdag_head = group.head_hash;
    let head = commit_from_hash(&perdag_head, &*write).await?;
    let last_mutation_id = head.mutation_id(client_id, &*write).await?;
    let client = must_get_client(client_id, &*write).await?;
    let perdag_base = base_snapshot_from_commit(&head, &*write).await?;
    if should_abort_refresh(memdag_base, &perdag_base, &perdag_head)? {
        debug!(client = %client_id, "memdag is up to date, skipping refresh");
        return Ok(None);
    }

    let mut visitor =
        GatherNotCachedVisitor::new(memdag, config.gather_size_limit, default_chunk_sizer());
    walk(&*write, &perdag_head, &mut visitor).await?;
    debug!(
        client = %client_id,
        head = %perdag_head,
        bytes = visitor.total_size(),
        "refresh gathered",
    );
    set_client(
        client_id,
        Client {
            temp_refresh_hash: Some(perdag_head.clone()),
            ..client
        },
        &*write,
    )
    .await?;
    write.commit().await?;
    Ok(Some(Pulled {
        perdag_head,
        last_mutation_id,
        chunks: visitor.into_gathered(),
    }))
}

/// Stage the pulled chunks, rebase the memdag's pending mutations onto the
/// durable head, and move the memdag head.
async fn rebase_memdag(
    memdag: &LazyStore,
    client_id: &str,
    mutators: &MutatorDefs,
    diff_config: &DiffConfig,
    pulled: Pulled,
) -> PersistResult<Option<(Hash, DiffsMap, Hash)>> {
    let write = memdag.lazy_write().await;
    let old_head = commit_from_head(DEFAULT_HEAD_NAME, &write).await?;
    let memdag_base = base_snapshot_from_commit(&old_head, &write).await?;
    // The pulled head is kept alive in the perdag by the client's temp
    // refresh hash, so reading it through the memdag cannot miss.
    let perdag_base = base_snapshot_from_hash(&pulled.perdag_head, &write).await?;
    if should_abort_refresh(&memdag_base, &perdag_base, &pulled.perdag_head)? {
        debug!(client = %client_id, "memdag advanced during refresh, aborting");
        return Ok(None);
    }

    let limits: MutationIds = [(client_id.to_owned(), pulled.last_mutation_id)].into();
    let new_mutations = local_mutations_greater_than(&old_head, &limits, &write).await?;
    for (chunk, size) in pulled.chunks {
        write.put_chunk_sized(chunk, Some(size)).await?;
    }

    let mut head_hash = pulled.perdag_head.clone();
    for mutation in new_mutations.iter().rev() {
        let Some(meta) = mutation.local_meta() else {
            continue;
        };
        let rebased =
            rebase_mutation_and_put_commit(mutation, &write, &head_hash, mutators, &meta.client_id)
                .await?;
        head_hash = rebased.hash().clone();
    }

    let new_head = commit_from_hash(&head_hash, &write).await?;
    let diffs = diff_commits(&old_head, &new_head, &write, diff_config).await?;
    write.set_head(DEFAULT_HEAD_NAME, &head_hash).await?;
    write.commit().await?;
    debug!(
        client = %client_id,
        head = %head_hash,
        rebased = new_mutations.len(),
        "refreshed memdag",
    );
    Ok(Some((head_hash, diffs, pulled.perdag_head)))
}

/// Clear the client's `temp_refresh_hash`, moving its head to the pulled
/// durable head if the refresh went through.
async fn finish_refresh(
    perdag: &dyn Store,
    client_id: &str,
    perdag_head: Option<Hash>,
) -> PersistResult<()> {
    let write = perdag.write().await?;
    let client = must_get_client(client_id, &*write).await?;
    let client = Client {
        head_hash: perdag_head.unwrap_or(client.head_hash),
        temp_refresh_hash: None,
        ..client
    };
    set_client(client_id, client, &*write).await?;
    write.commit().await?;
    Ok(())
}
