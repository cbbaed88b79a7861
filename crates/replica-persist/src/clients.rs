//! Client records in the durable store.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use replica_btree::{BTreeRead, BTreeWrite};
use replica_dag::{Read, Store, Write};
use replica_db::{
    base_snapshot_from_hash, compare_cookies_for_snapshots, create_index_btree, new_snapshot,
    ClientId, Commit, IndexDefinition, IndexRecord, MutationIds, SnapshotMeta,
};
use replica_types::{Hash, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::client_groups::{
    get_client_group, get_client_groups, set_client_group, ClientGroup, ClientGroupId,
};
use crate::error::{PersistError, PersistResult};

/// Head of the chunk holding every client record.
pub const CLIENTS_HEAD_NAME: &str = "clients";

/// The durable record of one client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub heartbeat_timestamp_ms: u64,
    /// Commit the client's memory store was last loaded from or persisted
    /// to. Keeps that commit alive in the durable store.
    pub head_hash: Hash,
    /// Durable head a refresh in flight is pulling in. Keeps it alive until
    /// the refresh finishes.
    pub temp_refresh_hash: Option<Hash>,
    #[serde(rename = "clientGroupID")]
    pub client_group_id: ClientGroupId,
}

impl Client {
    fn refs(&self) -> impl Iterator<Item = &Hash> {
        std::iter::once(&self.head_hash).chain(self.temp_refresh_hash.as_ref())
    }
}

pub type ClientMap = BTreeMap<ClientId, Client>;

pub async fn get_clients<R: Read + ?Sized>(read: &R) -> PersistResult<ClientMap> {
    let Some(hash) = read.get_head(CLIENTS_HEAD_NAME).await? else {
        return Ok(ClientMap::new());
    };
    let chunk = read.must_get_chunk(&hash).await?;
    serde_json::from_value(chunk.data().clone())
        .map_err(|err| PersistError::InvalidClientState(format!("clients {hash}: {err}")))
}

pub async fn get_client<R: Read + ?Sized>(id: &str, read: &R) -> PersistResult<Option<Client>> {
    Ok(get_clients(read).await?.remove(id))
}

/// Like [`get_client`], failing with `ClientStateNotFound` when the record
/// is gone.
pub async fn must_get_client<R: Read + ?Sized>(id: &str, read: &R) -> PersistResult<Client> {
    get_client(id, read)
        .await?
        .ok_or_else(|| PersistError::ClientStateNotFound(id.to_owned()))
}

pub async fn has_client_state<R: Read + ?Sized>(id: &str, read: &R) -> PersistResult<bool> {
    Ok(get_client(id, read).await?.is_some())
}

pub async fn assert_has_client_state<R: Read + ?Sized>(id: &str, read: &R) -> PersistResult<()> {
    must_get_client(id, read).await.map(|_| ())
}

/// Replace every client record. The chunk refs every head and temp refresh
/// hash.
pub async fn set_clients<W: Write + ?Sized>(clients: &ClientMap, write: &W) -> PersistResult<Hash> {
    let refs = clients.values().flat_map(Client::refs).cloned().collect();
    let chunk = write.create_chunk(serde_json::to_value(clients)?, refs)?;
    let hash = chunk.hash().clone();
    write.put_chunk(chunk).await?;
    write.set_head(CLIENTS_HEAD_NAME, &hash).await?;
    Ok(hash)
}

pub async fn set_client<W: Write + ?Sized>(
    id: &str,
    client: Client,
    write: &W,
) -> PersistResult<Hash> {
    let mut clients = get_clients(write).await?;
    clients.insert(id.to_owned(), client);
    set_clients(&clients, write).await
}

pub async fn get_client_group_id_for_client<R: Read + ?Sized>(
    id: &str,
    read: &R,
) -> PersistResult<Option<ClientGroupId>> {
    Ok(get_client(id, read).await?.map(|client| client.client_group_id))
}

/// The group of client `id`. A client whose group is gone is an error.
pub async fn get_client_group_for_client<R: Read + ?Sized>(
    id: &str,
    read: &R,
) -> PersistResult<Option<ClientGroup>> {
    let Some(group_id) = get_client_group_id_for_client(id, read).await? else {
        return Ok(None);
    };
    get_client_group(&group_id, read)
        .await?
        .map(Some)
        .ok_or(PersistError::ClientGroupNotFound(group_id))
}

/// A newly registered client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitClient {
    pub client_id: ClientId,
    pub client: Client,
    /// Whether a new group was created for the client.
    pub new_client_group: bool,
}

/// Where a new client starts, as found by [`find_matching_client`].
#[derive(Clone, Debug, PartialEq)]
pub enum FindMatchingClient {
    /// There is no group at all.
    New,
    /// No group matches. The new group forks this base snapshot, the one
    /// with the newest cookie across all groups.
    Fork(Commit),
    /// An enabled group with the same mutator names and indexes.
    Head {
        client_group_id: ClientGroupId,
        head_hash: Hash,
    },
}

/// Find the group a client with `mutator_names` and `indexes` should join,
/// or the snapshot its new group should fork from.
pub async fn find_matching_client<R: Read + ?Sized>(
    read: &R,
    mutator_names: &[String],
    indexes: &BTreeMap<String, IndexDefinition>,
) -> PersistResult<FindMatchingClient> {
    let wanted: HashSet<&String> = mutator_names.iter().collect();
    let mut newest: Option<Commit> = None;
    for (id, group) in get_client_groups(read).await? {
        if !group.disabled
            && group.indexes == *indexes
            && group.mutator_names.iter().collect::<HashSet<_>>() == wanted
        {
            return Ok(FindMatchingClient::Head {
                client_group_id: id,
                head_hash: group.head_hash,
            });
        }

        let snapshot = base_snapshot_from_hash(&group.head_hash, read).await?;
        let newer = match &newest {
            Some(best) => compare_cookies_for_snapshots(&snapshot, best)? == Ordering::Greater,
            None => true,
        };
        if newer {
            newest = Some(snapshot);
        }
    }
    Ok(newest.map_or(FindMatchingClient::New, FindMatchingClient::Fork))
}

/// The index of `old` built the same way as `definition`. Names are ignored.
pub fn find_matching_old_index<'r>(
    old: &'r [IndexRecord],
    definition: &IndexDefinition,
) -> Option<&'r IndexRecord> {
    old.iter().find(|record| {
        let d = &record.definition;
        d.key_prefix == definition.key_prefix
            && d.json_pointer == definition.json_pointer
            && d.allow_empty == definition.allow_empty
    })
}

/// Register a new client in `perdag`.
///
/// The client joins an enabled group created with the same mutator names
/// and index definitions, starting at that group's head. Otherwise a new
/// group is created. It forks the newest base snapshot of the existing
/// groups, keeping its cookie and values and reusing matching index trees,
/// or starts from an empty genesis snapshot when there are no groups.
pub async fn init_client(
    perdag: &dyn Store,
    mutator_names: &[String],
    indexes: &BTreeMap<String, IndexDefinition>,
    heartbeat_timestamp_ms: u64,
) -> PersistResult<InitClient> {
    let w = perdag.write().await?;
    let client_id = Uuid::now_v7().to_string();

    let (client_group_id, head_hash, new_client_group) =
        match find_matching_client(&*w, mutator_names, indexes).await? {
            FindMatchingClient::Head {
                client_group_id,
                head_hash,
            } => (client_group_id, head_hash, false),
            found => {
                let (basis_hash, cookie_json, value_hash, old_indexes) = match found {
                    FindMatchingClient::Fork(snapshot) => {
                        let meta = snapshot.snapshot_meta().ok_or_else(|| {
                            PersistError::InvalidClientState(format!(
                                "base snapshot {} is not a snapshot",
                                snapshot.hash()
                            ))
                        })?;
                        (
                            meta.basis_hash.clone(),
                            meta.cookie_json.clone(),
                            snapshot.value_hash().clone(),
                            snapshot.indexes().to_vec(),
                        )
                    }
                    _ => {
                        let empty = BTreeWrite::new(&*w, Hash::empty()).flush().await?;
                        (None, Value::Null, empty, Vec::new())
                    }
                };

                let map = BTreeRead::new(&*w, value_hash.clone());
                let mut records = Vec::with_capacity(indexes.len());
                for definition in indexes.values() {
                    let value_hash = match find_matching_old_index(&old_indexes, definition) {
                        Some(old) => old.value_hash.clone(),
                        None => create_index_btree(&*w, &map, definition).await?,
                    };
                    records.push(IndexRecord {
                        definition: definition.clone(),
                        value_hash,
                    });
                }
                let meta = SnapshotMeta {
                    basis_hash,
                    last_mutation_ids: MutationIds::new(),
                    cookie_json,
                };
                let genesis = new_snapshot(&*w, meta, value_hash, records)?;
                w.put_chunk(genesis.chunk().clone()).await?;

                let id = Uuid::now_v7().to_string();
                let group = ClientGroup {
                    head_hash: genesis.hash().clone(),
                    mutator_names: mutator_names.to_vec(),
                    indexes: indexes.clone(),
                    mutation_ids: MutationIds::new(),
                    last_server_ackd_mutation_ids: MutationIds::new(),
                    disabled: false,
                };
                set_client_group(&id, group, &*w).await?;
                (id, genesis.hash().clone(), true)
            }
        };

    let client = Client {
        heartbeat_timestamp_ms,
        head_hash,
        temp_refresh_hash: None,
        client_group_id,
    };
    set_client(&client_id, client.clone(), &*w).await?;
    w.commit().await?;
    debug!(
        client = %client_id,
        client_group = %client.client_group_id,
        new_client_group,
        "init client",
    );
    Ok(InitClient {
        client_id,
        client,
        new_client_group,
    })
}
