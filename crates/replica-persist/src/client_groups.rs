//! Client groups: clients that share one commit chain in the durable store.

use std::collections::{BTreeMap, HashSet};

use replica_dag::{Read, Write};
use replica_db::{IndexDefinition, MutationIds};
use replica_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PersistError, PersistResult};

/// Head of the chunk holding every client group.
pub const CLIENT_GROUPS_HEAD_NAME: &str = "client-groups";

pub type ClientGroupId = String;

/// A commit chain shared by the clients of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroup {
    /// Head of the group's chain in the durable store.
    pub head_hash: Hash,
    /// Mutators the group's clients were created with. Never changes.
    pub mutator_names: Vec<String>,
    /// Index definitions by name. Never changes.
    pub indexes: BTreeMap<String, IndexDefinition>,
    /// Last mutation id per client that is part of the chain at `head_hash`.
    #[serde(rename = "mutationIDs")]
    pub mutation_ids: MutationIds,
    /// Last mutation id per client confirmed by the server.
    #[serde(rename = "lastServerAckdMutationIDs")]
    pub last_server_ackd_mutation_ids: MutationIds,
    #[serde(default)]
    pub disabled: bool,
}

impl ClientGroup {
    /// Whether any client has mutations the server has not acknowledged.
    pub fn has_pending_mutations(&self) -> bool {
        self.mutation_ids.iter().any(|(client, id)| {
            *id > self.last_server_ackd_mutation_ids.get(client).copied().unwrap_or(0)
        })
    }
}

pub type ClientGroupMap = BTreeMap<ClientGroupId, ClientGroup>;

pub async fn get_client_groups<R: Read + ?Sized>(read: &R) -> PersistResult<ClientGroupMap> {
    let Some(hash) = read.get_head(CLIENT_GROUPS_HEAD_NAME).await? else {
        return Ok(ClientGroupMap::new());
    };
    let chunk = read.must_get_chunk(&hash).await?;
    serde_json::from_value(chunk.data().clone())
        .map_err(|err| PersistError::InvalidClientState(format!("client groups {hash}: {err}")))
}

pub async fn get_client_group<R: Read + ?Sized>(
    id: &str,
    read: &R,
) -> PersistResult<Option<ClientGroup>> {
    Ok(get_client_groups(read).await?.remove(id))
}

fn validate_update(
    id: &str,
    group: &ClientGroup,
    current: Option<&ClientGroup>,
) -> PersistResult<()> {
    let names: HashSet<&String> = group.mutator_names.iter().collect();
    if names.len() != group.mutator_names.len() {
        return Err(PersistError::InvalidClientGroupUpdate(format!(
            "mutator names of {id} must be a set"
        )));
    }
    if let Some(current) = current {
        if current.indexes != group.indexes {
            return Err(PersistError::InvalidClientGroupUpdate(format!(
                "index definitions of {id} must never change"
            )));
        }
        let current_names: HashSet<&String> = current.mutator_names.iter().collect();
        if current_names != names {
            return Err(PersistError::InvalidClientGroupUpdate(format!(
                "mutator names of {id} must never change"
            )));
        }
    }
    Ok(())
}

/// Replace every client group. The chunk refs the head of every group.
pub async fn set_client_groups<W: Write + ?Sized>(
    groups: &ClientGroupMap,
    write: &W,
) -> PersistResult<Hash> {
    let current = get_client_groups(write).await?;
    for (id, group) in groups {
        validate_update(id, group, current.get(id))?;
    }
    let refs = groups.values().map(|group| group.head_hash.clone()).collect();
    let chunk = write.create_chunk(serde_json::to_value(groups)?, refs)?;
    let hash = chunk.hash().clone();
    write.put_chunk(chunk).await?;
    write.set_head(CLIENT_GROUPS_HEAD_NAME, &hash).await?;
    Ok(hash)
}

pub async fn set_client_group<W: Write + ?Sized>(
    id: &str,
    group: ClientGroup,
    write: &W,
) -> PersistResult<Hash> {
    let mut groups = get_client_groups(write).await?;
    groups.insert(id.to_owned(), group);
    set_client_groups(&groups, write).await
}

pub async fn delete_client_group<W: Write + ?Sized>(id: &str, write: &W) -> PersistResult<Hash> {
    let mut groups = get_client_groups(write).await?;
    groups.remove(id);
    debug!(client_group = %id, "delete client group");
    set_client_groups(&groups, write).await
}

/// Mark a group disabled. Missing groups are ignored.
pub async fn disable_client_group<W: Write + ?Sized>(id: &str, write: &W) -> PersistResult<()> {
    let Some(mut group) = get_client_group(id, write).await? else {
        return Ok(());
    };
    group.disabled = true;
    set_client_group(id, group, write).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use replica_dag::{Store, StoreImpl};
    use replica_kv::MemKvStore;
    use replica_types::fake_hasher;
    use serde_json::json;

    fn group(head: &Hash) -> ClientGroup {
        ClientGroup {
            head_hash: head.clone(),
            mutator_names: vec!["put".into(), "del".into()],
            indexes: BTreeMap::new(),
            mutation_ids: [("c1".to_string(), 2)].into(),
            last_server_ackd_mutation_ids: [("c1".to_string(), 1)].into(),
            disabled: false,
        }
    }

    #[tokio::test]
    async fn groups_are_stored_under_their_head() {
        let store = StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("f0"));
        let w = store.write().await.unwrap();
        let head = w.create_chunk(json!("commit"), vec![]).unwrap();
        w.put_chunk(head.clone()).await.unwrap();

        assert!(get_client_groups(&*w).await.unwrap().is_empty());
        let hash = set_client_group("g1", group(head.hash()), &*w).await.unwrap();
        assert_eq!(w.get_head(CLIENT_GROUPS_HEAD_NAME).await.unwrap(), Some(hash.clone()));
        assert_eq!(w.must_get_chunk(&hash).await.unwrap().meta(), &[head.hash().clone()]);
        w.commit().await.unwrap();
        drop(w);

        let r = store.read().await.unwrap();
        let loaded = get_client_group("g1", &*r).await.unwrap().unwrap();
        assert_eq!(loaded, group(head.hash()));
        assert!(loaded.has_pending_mutations());
        let stored = r.must_get_chunk(&hash).await.unwrap();
        assert_eq!(stored.data()["g1"]["mutationIDs"], json!({"c1": 2}));
    }

    #[tokio::test]
    async fn immutable_fields_are_enforced() {
        let store = StoreImpl::new(Arc::new(MemKvStore::new()), fake_hasher("f1"));
        let w = store.write().await.unwrap();
        let head = w.create_chunk(json!("commit"), vec![]).unwrap();
        w.put_chunk(head.clone()).await.unwrap();
        set_client_group("g1", group(head.hash()), &*w).await.unwrap();

        let mut renamed = group(head.hash());
        renamed.mutator_names = vec!["put".into()];
        assert!(matches!(
            set_client_group("g1", renamed, &*w).await,
            Err(PersistError::InvalidClientGroupUpdate(_))
        ));

        let mut duplicated = group(head.hash());
        duplicated.mutator_names.push("put".into());
        assert!(set_client_group("g2", duplicated, &*w).await.is_err());

        let mut reordered = group(head.hash());
        reordered.mutator_names.reverse();
        reordered.last_server_ackd_mutation_ids = reordered.mutation_ids.clone();
        set_client_group("g1", reordered, &*w).await.unwrap();
        assert!(!get_client_group("g1", &*w).await.unwrap().unwrap().has_pending_mutations());

        disable_client_group("g1", &*w).await.unwrap();
        assert!(get_client_group("g1", &*w).await.unwrap().unwrap().disabled);
        delete_client_group("g1", &*w).await.unwrap();
        assert!(get_client_group("g1", &*w).await.unwrap().is_none());
    }
}
