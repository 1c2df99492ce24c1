use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::branches::{get_branch, get_branches, set_branch, Branch};
use super::registry::{read_map, update_map, write_map, RegistryMap};
use crate::primitives::concurrency::Shutdown;
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{with_write, DagRead, DagWrite, Store};
use crate::storage::db::{base_snapshot_from_hash, compare_cookies, Commit, IndexDefinitions, Write};
use crate::types::{now_ms, BranchId, ClientId, Hash, MutationIds, PenumbraError, Result};

/// Head under which the client map lives.
pub const CLIENTS_HEAD_NAME: &str = "clients";

/// One running client instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    /// Last time the client reported itself alive.
    pub heartbeat_timestamp_ms: u64,
    /// Head of the client's working copy as of its last persist or refresh.
    pub head_hash: Hash,
    /// Durable head pinned while a refresh copies it into the working store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_refresh_hash: Option<Hash>,
    /// Branch the client belongs to.
    pub branch_id: BranchId,
}

/// Clients by id.
pub type ClientMap = BTreeMap<ClientId, Client>;

impl RegistryMap for ClientMap {
    const HEAD: &'static str = CLIENTS_HEAD_NAME;

    fn refs(&self) -> Vec<Hash> {
        let mut refs = Vec::with_capacity(self.len());
        for client in self.values() {
            refs.push(client.head_hash);
            refs.extend(client.temp_refresh_hash);
        }
        refs
    }
}

/// Every client.
pub fn get_clients(dag: &dyn DagRead) -> Result<ClientMap> {
    read_map(dag)
}

/// One client, if present.
pub fn get_client(id: &ClientId, dag: &dyn DagRead) -> Result<Option<Client>> {
    Ok(get_clients(dag)?.remove(id))
}

/// One client that must be present.
pub fn must_get_client(id: &ClientId, dag: &dyn DagRead) -> Result<Client> {
    get_client(id, dag)?.ok_or_else(|| PenumbraError::ClientStateNotFound { id: id.clone() })
}

/// Fails with `ClientStateNotFound` when the client's entry is gone.
pub fn assert_has_client_state(id: &ClientId, dag: &dyn DagRead) -> Result<()> {
    must_get_client(id, dag).map(|_| ())
}

/// Replaces the whole client map.
pub fn set_clients(clients: &ClientMap, dag: &mut dyn DagWrite) -> Result<Hash> {
    write_map(dag, clients)
}

/// Inserts or replaces one client.
pub fn set_client(id: &ClientId, client: Client, dag: &mut dyn DagWrite) -> Result<Hash> {
    let mut clients = get_clients(dag.as_read())?;
    clients.insert(id.clone(), client);
    write_map(dag, &clients)
}

/// Branch the client belongs to, if both still exist.
pub fn get_branch_for_client(id: &ClientId, dag: &dyn DagRead) -> Result<Option<Branch>> {
    match get_client(id, dag)? {
        Some(client) => get_branch(&client.branch_id, dag),
        None => Ok(None),
    }
}

/// Branch the client belongs to. A missing client fails with
/// `ClientStateNotFound`, a missing branch with `BranchStateNotFound`.
pub fn must_get_branch_for_client(id: &ClientId, dag: &dyn DagRead) -> Result<(BranchId, Branch)> {
    let client = must_get_client(id, dag)?;
    let branch = get_branch(&client.branch_id, dag)?.ok_or_else(|| {
        PenumbraError::BranchStateNotFound {
            id: client.branch_id.clone(),
        }
    })?;
    Ok((client.branch_id, branch))
}

/// Optimistic read-modify-write of the client map.
pub fn update_clients<F>(store: &dyn Store, guard: Option<&Shutdown>, transform: F) -> Result<ClientMap>
where
    F: FnMut(&ClientMap) -> Result<Option<ClientMap>>,
{
    update_map(store, guard, transform)
}

/// Where a newly opened client starts.
#[derive(Clone, Debug)]
pub enum FindMatchingClient {
    /// No branch to reuse: start from an empty genesis snapshot.
    New,
    /// No compatible branch, but this is the newest snapshot to fork from.
    Fork(Commit),
    /// Join an existing compatible branch.
    Head {
        /// Branch to join.
        branch_id: BranchId,
        /// Its current head.
        head_hash: Hash,
    },
}

/// Picks the branch a client with these mutators and indexes should use.
///
/// A live branch with the same mutator set and index definitions is joined,
/// the one with the newest base snapshot winning when several qualify.
/// Otherwise the newest base snapshot across all branches is forked.
pub fn find_matching_client(
    dag: &dyn DagRead,
    mutator_names: &BTreeSet<String>,
    indexes: &IndexDefinitions,
) -> Result<FindMatchingClient> {
    let mut newest_snapshot: Option<Commit> = None;
    let mut best_match: Option<(BranchId, Hash, Commit)> = None;
    for (branch_id, branch) in get_branches(dag)? {
        let snapshot = base_snapshot_from_hash(&branch.head_hash, dag)?;
        let compatible = !branch.disabled
            && &branch.mutator_names == mutator_names
            && &branch.index_definitions == indexes;
        if compatible && is_newer(&snapshot, best_match.as_ref().map(|(_, _, s)| s))? {
            best_match = Some((branch_id, branch.head_hash, snapshot.clone()));
        }
        if is_newer(&snapshot, newest_snapshot.as_ref())? {
            newest_snapshot = Some(snapshot);
        }
    }
    Ok(match (best_match, newest_snapshot) {
        (Some((branch_id, head_hash, _)), _) => FindMatchingClient::Head { branch_id, head_hash },
        (None, Some(snapshot)) => FindMatchingClient::Fork(snapshot),
        (None, None) => FindMatchingClient::New,
    })
}

fn is_newer(snapshot: &Commit, than: Option<&Commit>) -> Result<bool> {
    let Some(than) = than else {
        return Ok(true);
    };
    let (Some(a), Some(b)) = (snapshot.as_snapshot(), than.as_snapshot()) else {
        return Err(PenumbraError::Corruption("base snapshot is not a snapshot"));
    };
    Ok(compare_cookies(&a.cookie, &b.cookie)? == Ordering::Greater)
}

/// Outcome of [`init_client`].
#[derive(Clone, Debug)]
pub struct InitClient {
    /// Id of the new client.
    pub client_id: ClientId,
    /// Its registry entry.
    pub client: Client,
    /// Head the working store starts from.
    pub head_hash: Hash,
    /// Client map after the insert.
    pub clients: ClientMap,
    /// Whether a new branch was created for the client.
    pub new_branch: bool,
}

/// Registers a new client in one durable write, joining a compatible branch
/// or creating one by forking the newest snapshot (or from genesis).
pub fn init_client(
    store: &dyn Store,
    mutator_names: &BTreeSet<String>,
    indexes: &IndexDefinitions,
    opts: BTreeOptions,
) -> Result<InitClient> {
    with_write(store, |w| {
        let client_id = ClientId::random();
        let mut clients = get_clients(w.as_read())?;
        let matching = find_matching_client(w.as_read(), mutator_names, indexes)?;

        let (branch_id, head_hash, new_branch) = match matching {
            FindMatchingClient::Head { branch_id, head_hash } => (branch_id, head_hash, false),
            FindMatchingClient::New => {
                let commit = Write::new_genesis(w, indexes, opts).put_commit()?;
                (BranchId::random(), commit.hash(), true)
            }
            FindMatchingClient::Fork(snapshot) => {
                let commit = Write::new_fork(w, &snapshot, indexes, opts)?.put_commit()?;
                (BranchId::random(), commit.hash(), true)
            }
        };

        if new_branch {
            let branch = Branch {
                head_hash,
                mutator_names: mutator_names.clone(),
                index_definitions: indexes.clone(),
                mutation_ids: MutationIds::new(),
                last_server_ackd_mutation_ids: MutationIds::new(),
                disabled: false,
            };
            set_branch(&branch_id, branch, w)?;
        }

        let client = Client {
            heartbeat_timestamp_ms: now_ms(),
            head_hash,
            temp_refresh_hash: None,
            branch_id: branch_id.clone(),
        };
        clients.insert(client_id.clone(), client.clone());
        set_clients(&clients, w)?;
        w.commit()?;
        info!(client = %client_id, branch = %branch_id, new_branch, "persist.client.init");
        Ok(InitClient {
            client_id,
            client,
            head_hash,
            clients,
            new_branch,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::branches::must_get_branch;
    use crate::primitives::kv::{KvProvider, MemKvProvider};
    use crate::storage::dag::{with_read, DagStore};
    use crate::storage::db::{commit_from_hash, IndexDefinition, MutationInfo, SnapshotMeta};
    use crate::types::ChunkHasher;
    use serde_json::json;

    fn store() -> Result<DagStore> {
        let kv = MemKvProvider::new().open("clients")?;
        Ok(DagStore::with_hasher(kv, ChunkHasher::sequential()))
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn opts() -> BTreeOptions {
        BTreeOptions::with_sizes(200, 400)
    }

    #[test]
    fn first_client_gets_genesis_branch() -> Result<()> {
        let store = store()?;
        let init = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        assert!(init.new_branch);
        with_read(&store, |r| {
            let client = must_get_client(&init.client_id, r)?;
            assert_eq!(client.head_hash, init.head_hash);
            let branch = must_get_branch(&client.branch_id, r)?;
            assert_eq!(branch.head_hash, init.head_hash);
            let genesis = commit_from_hash(&init.head_hash, r)?;
            let meta = genesis.as_snapshot().cloned();
            assert_eq!(
                meta,
                Some(SnapshotMeta {
                    basis_hash: None,
                    last_mutation_ids: MutationIds::new(),
                    cookie: serde_json::Value::Null,
                })
            );
            Ok(())
        })
    }

    #[test]
    fn compatible_client_joins_branch() -> Result<()> {
        let store = store()?;
        let a = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        let b = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        assert!(!b.new_branch);
        assert_eq!(a.client.branch_id, b.client.branch_id);
        assert_eq!(b.clients.len(), 2);
        Ok(())
    }

    #[test]
    fn incompatible_client_forks_newest_snapshot() -> Result<()> {
        let store = store()?;
        let a = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;

        // Give the first branch a server snapshot with data.
        with_write(&store, |w| {
            let lmids: MutationIds = [(a.client_id.clone(), 3)].into_iter().collect();
            let mut snap = Write::new_snapshot(w, a.head_hash, lmids, json!(7), opts())?;
            snap.put("k", json!("v"))?;
            let commit = snap.put_commit()?;
            let (_, mut branch) = must_get_branch_for_client(&a.client_id, w.as_read())?;
            branch.head_hash = commit.hash();
            set_branch(&a.client.branch_id, branch, w)?;
            w.commit()
        })?;

        let mut indexes = IndexDefinitions::new();
        indexes.insert("by-v".to_string(), IndexDefinition::new(""));
        let b = init_client(&store, &names(&["put", "del"]), &indexes, opts())?;
        assert!(b.new_branch);
        assert_ne!(a.client.branch_id, b.client.branch_id);
        with_read(&store, |r| {
            let fork = commit_from_hash(&b.head_hash, r)?;
            let meta = fork
                .as_snapshot()
                .ok_or(PenumbraError::Invalid("fork is a snapshot"))?;
            assert_eq!(meta.cookie, json!(7));
            assert!(meta.last_mutation_ids.is_empty());
            assert_eq!(fork.indexes().len(), 1);
            let read = crate::storage::db::Read::new(r, fork);
            assert_eq!(read.get("k")?, Some(json!("v")));
            Ok(())
        })
    }

    #[test]
    fn disabled_branch_is_not_joined() -> Result<()> {
        let store = store()?;
        let a = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        with_write(&store, |w| {
            crate::persist::branches::disable_branch(&a.client.branch_id, w)?;
            w.commit()
        })?;
        let b = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        assert!(b.new_branch);
        Ok(())
    }

    #[test]
    fn refs_include_refresh_hash() -> Result<()> {
        let store = store()?;
        let init = init_client(&store, &names(&["put"]), &IndexDefinitions::new(), opts())?;
        let local = with_write(&store, |w| {
            let info = MutationInfo {
                client_id: init.client_id.clone(),
                mutator_name: "put".to_string(),
                mutator_args: json!(null),
                original_hash: None,
                timestamp: 1,
            };
            let commit = Write::new_local(w, init.head_hash, info, opts())?.put_commit()?;
            let mut client = init.client.clone();
            client.temp_refresh_hash = Some(commit.hash());
            set_client(&init.client_id, client, w)?;
            w.commit()?;
            Ok(commit.hash())
        })?;
        // The local commit survives GC because the client map pins it.
        assert!(with_read(&store, |r| r.has_chunk(&local))?);
        Ok(())
    }

    #[test]
    fn missing_client_is_reported() -> Result<()> {
        let store = store()?;
        let err = with_read(&store, |r| assert_has_client_state(&ClientId::from("ghost"), r));
        assert!(matches!(err, Err(ref e) if e.is_client_state_not_found()));
        Ok(())
    }
}
