//! Commits, transactional writes and rebase for the Replica sync engine.
//!
//! Every change to the client's data is a commit chained to its basis. A
//! chain runs from the head back to a server-confirmed snapshot, with the
//! pending local mutations in between. When a new snapshot arrives the
//! pending mutations are replayed on top of it.
//!
//! # Key Types
//!
//! - [`Commit`] / [`Meta`]: a parsed commit chunk and its local, snapshot,
//!   or index change metadata
//! - [`Write`]: builds one commit from map and index edits
//! - [`DiffsMap`] / [`DiffConfig`]: per-map diffs between two commits
//! - [`Mutator`]: a named mutation that can be replayed during rebase

pub mod commit;
pub mod error;
pub mod index;
pub mod rebase;
pub mod write;

pub use commit::{
    base_snapshot_from_commit, base_snapshot_from_hash, base_snapshot_from_head, commit_chain,
    commit_from_hash, commit_from_head, compare_cookies, compare_cookies_for_snapshots,
    get_mutation_id, local_mutations, local_mutations_greater_than, new_index_change, new_local,
    new_snapshot, ClientId, Commit, CommitData, IndexChangeMeta, IndexDefinition, IndexRecord,
    LocalMeta, Meta, MutationIds, SnapshotMeta, DEFAULT_HEAD_NAME,
};
pub use error::{DbError, DbResult};
pub use index::{
    create_index_btree, decode_index_key, encode_index_key, get_index_keys, index_value,
    IndexOperation,
};
pub use rebase::{rebase_mutation_and_commit, rebase_mutation_and_put_commit, Mutator, MutatorDefs};
pub use write::{diff_commits, DiffConfig, DiffsMap, IndexSelection, Write};
