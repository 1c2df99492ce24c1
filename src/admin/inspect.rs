//! Read-only views of a store's registries and heads.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::{open_registry, open_store};
use crate::admin::Result;
use crate::persist::{get_branches, get_clients, DatabaseRecord, BRANCHES_HEAD_NAME, CLIENTS_HEAD_NAME};
use crate::storage::dag::{with_read, Store};
use crate::storage::db::{DEFAULT_HEAD_NAME, REFRESH_HEAD_NAME, SYNC_HEAD_NAME};
use crate::types::{now_ms, Hash, MutationIds};

const KNOWN_HEADS: [&str; 5] = [
    CLIENTS_HEAD_NAME,
    BRANCHES_HEAD_NAME,
    DEFAULT_HEAD_NAME,
    SYNC_HEAD_NAME,
    REFRESH_HEAD_NAME,
];

/// One named head of a store.
#[derive(Clone, Debug, Serialize)]
pub struct HeadEntry {
    /// Head name.
    pub name: String,
    /// Chunk the head points at.
    pub hash: Hash,
}

/// Heads currently set in a store.
#[derive(Clone, Debug, Serialize)]
pub struct HeadsReport {
    /// Store the report describes.
    pub database: String,
    /// Set heads, in a fixed order.
    pub heads: Vec<HeadEntry>,
}

/// One row of [`ClientsReport`].
#[derive(Clone, Debug, Serialize)]
pub struct ClientEntry {
    /// Client id.
    pub id: String,
    /// Branch the client belongs to.
    pub branch_id: String,
    /// Last commit the client persisted or refreshed to.
    pub head_hash: Hash,
    /// Last heartbeat.
    pub heartbeat_timestamp_ms: u64,
    /// Time since the last heartbeat.
    pub idle_ms: u64,
    /// Set while a refresh of the client is in flight.
    pub temp_refresh_hash: Option<Hash>,
}

/// Contents of the client registry.
#[derive(Clone, Debug, Serialize)]
pub struct ClientsReport {
    /// Store the report describes.
    pub database: String,
    /// Clock reading used for `idle_ms`.
    pub now_ms: u64,
    /// Registered clients, sorted by id.
    pub clients: Vec<ClientEntry>,
}

/// One row of [`BranchesReport`].
#[derive(Clone, Debug, Serialize)]
pub struct BranchEntry {
    /// Branch id.
    pub id: String,
    /// Head commit of the branch.
    pub head_hash: Hash,
    /// Mutators the branch was created for.
    pub mutator_names: Vec<String>,
    /// Names of the branch's indexes.
    pub indexes: Vec<String>,
    /// Clients currently on the branch.
    pub clients: usize,
    /// Whether mutations still await acknowledgement.
    pub pending: bool,
    /// Whether recovery gave up on the branch.
    pub disabled: bool,
    /// Last mutation id per client.
    pub mutation_ids: BTreeMap<String, u64>,
    /// Last id the server acknowledged per client.
    pub last_server_ackd_mutation_ids: BTreeMap<String, u64>,
}

/// Contents of the branch registry.
#[derive(Clone, Debug, Serialize)]
pub struct BranchesReport {
    /// Store the report describes.
    pub database: String,
    /// Registered branches, sorted by id.
    pub branches: Vec<BranchEntry>,
}

/// Stores listed in a data directory's registry.
#[derive(Clone, Debug, Serialize)]
pub struct DatabasesReport {
    /// Directory the report describes.
    pub data_dir: String,
    /// Registered stores, sorted by name.
    pub databases: Vec<DatabaseRecord>,
}

/// Lists the heads set in store `name`.
pub fn heads(data_dir: &Path, name: &str, opts: &AdminOpenOptions) -> Result<HeadsReport> {
    let handle = open_store(data_dir, name, opts)?;
    let heads = with_read(&*handle.store, |r| {
        let mut heads = Vec::new();
        for head in KNOWN_HEADS {
            if let Some(hash) = r.get_head(head)? {
                heads.push(HeadEntry {
                    name: head.to_string(),
                    hash,
                });
            }
        }
        Ok(heads)
    })?;
    handle.store.close()?;
    Ok(HeadsReport {
        database: name.to_string(),
        heads,
    })
}

/// Lists the client registry of store `name`.
pub fn clients(data_dir: &Path, name: &str, opts: &AdminOpenOptions) -> Result<ClientsReport> {
    let handle = open_store(data_dir, name, opts)?;
    let map = with_read(&*handle.store, |r| get_clients(r))?;
    handle.store.close()?;
    let now = now_ms();
    let clients = map
        .into_iter()
        .map(|(id, c)| ClientEntry {
            id: id.to_string(),
            branch_id: c.branch_id.to_string(),
            head_hash: c.head_hash,
            heartbeat_timestamp_ms: c.heartbeat_timestamp_ms,
            idle_ms: now.saturating_sub(c.heartbeat_timestamp_ms),
            temp_refresh_hash: c.temp_refresh_hash,
        })
        .collect();
    Ok(ClientsReport {
        database: name.to_string(),
        now_ms: now,
        clients,
    })
}

/// Lists the branch registry of store `name`.
pub fn branches(data_dir: &Path, name: &str, opts: &AdminOpenOptions) -> Result<BranchesReport> {
    let handle = open_store(data_dir, name, opts)?;
    let (branch_map, client_map) =
        with_read(&*handle.store, |r| Ok((get_branches(r)?, get_clients(r)?)))?;
    handle.store.close()?;
    let branches = branch_map
        .into_iter()
        .map(|(id, b)| BranchEntry {
            clients: client_map.values().filter(|c| c.branch_id == id).count(),
            pending: b.has_pending_mutations(),
            id: id.to_string(),
            head_hash: b.head_hash,
            mutator_names: b.mutator_names.into_iter().collect(),
            indexes: b.index_definitions.into_keys().collect(),
            disabled: b.disabled,
            mutation_ids: ids_by_client(&b.mutation_ids),
            last_server_ackd_mutation_ids: ids_by_client(&b.last_server_ackd_mutation_ids),
        })
        .collect();
    Ok(BranchesReport {
        database: name.to_string(),
        branches,
    })
}

/// Lists the stores registered in `data_dir`. A directory without a
/// registry reports no stores.
pub fn databases(data_dir: &Path, opts: &AdminOpenOptions) -> Result<DatabasesReport> {
    let databases = match open_registry(data_dir, opts)? {
        Some(registry) => {
            let map = registry.get_databases()?;
            registry.close()?;
            map.into_values().collect()
        }
        None => Vec::new(),
    };
    Ok(DatabasesReport {
        data_dir: data_dir.display().to_string(),
        databases,
    })
}

fn ids_by_client(ids: &MutationIds) -> BTreeMap<String, u64> {
    ids.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}
