//! Client records and the persist/refresh protocol for the Replica sync
//! engine.
//!
//! Each client works against an in-memory [`LazyStore`](replica_dag::LazyStore)
//! (the memdag) layered over a durable store shared by its client group (the
//! perdag). [`persist`] moves the memdag's new snapshot and pending mutations
//! into the perdag. [`refresh`] pulls the group's newer durable head back
//! into the memdag, replaying the memdag's own pending mutations on top.
//!
//! # Key Types
//!
//! - [`Client`] / [`ClientGroup`]: durable records of clients and the
//!   commit chains they share
//! - [`init_client`]: registers a client, joining or creating a group
//! - [`persist`] / [`refresh`]: the two directions of the protocol
//! - [`RefreshConfig`]: gather budget and pacing of a refresh

pub mod client_groups;
pub mod clients;
pub mod config;
pub mod error;
pub mod gather;
pub mod persist;
pub mod refresh;

#[cfg(test)]
mod testing;

pub use client_groups::{
    delete_client_group, disable_client_group, get_client_group, get_client_groups,
    set_client_group, set_client_groups, ClientGroup, ClientGroupId, ClientGroupMap,
    CLIENT_GROUPS_HEAD_NAME,
};
pub use clients::{
    assert_has_client_state, find_matching_client, find_matching_old_index, get_client,
    get_client_group_for_client, get_client_group_id_for_client, get_clients, has_client_state,
    init_client, must_get_client, set_client, set_clients, Client, ClientMap, FindMatchingClient,
    InitClient, CLIENTS_HEAD_NAME,
};
pub use config::RefreshConfig;
pub use error::{PersistError, PersistResult};
pub use gather::{GatherMemdagVisitor, GatherNotCachedVisitor, RestrictVisitor};
pub use persist::{persist, Closed};
pub use refresh::{refresh, should_abort_refresh};
