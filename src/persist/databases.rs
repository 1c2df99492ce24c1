//! Registry of the durable stores this process has created, and collection
//! of the ones nobody opened for a long time.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::branches::get_branches;
use super::clients::get_clients;
use crate::primitives::concurrency::{spawn_interval, IntervalSchedule, Shutdown};
use crate::primitives::kv::{KvProvider, KvStore};
use crate::storage::dag::{with_read, DagStore};
use crate::types::ids::random_id;
use crate::types::{now_ms, PenumbraError, Result};

/// Name of the byte store holding the registry.
pub const DATABASES_STORE_NAME: &str = "penumbra-dbs";

/// On-disk layout version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

/// Stores not opened for this long are collected. Applies to stores whose
/// record carries no open timestamp.
pub const DATABASE_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Stores with an open timestamp are collected after this long, provided no
/// branch in them holds unacknowledged mutations.
pub const BRANCH_DATABASE_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Delay before the first collection.
pub const COLLECT_DELAY: Duration = Duration::from_secs(5 * 60);

/// Interval between collections.
pub const COLLECT_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const DATABASES_KEY: &str = "databases";
const PROFILE_ID_KEY: &str = "profile-id";

/// One durable store known to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRecord {
    /// Byte store name.
    pub name: String,
    /// Application the store belongs to.
    pub app_name: String,
    /// Layout version the store was written with.
    pub format_version: u32,
    /// Application schema version.
    pub schema_version: String,
    /// Last time a replica opened the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_opened_timestamp_ms: Option<u64>,
}

/// Records by store name.
pub type DatabaseMap = BTreeMap<String, DatabaseRecord>;

/// Byte store name for an application and schema version.
pub fn database_name(app_name: &str, schema_version: &str) -> String {
    format!("penumbra-{app_name}-{FORMAT_VERSION}-{schema_version}")
}

/// Handle on the registry store.
#[derive(Clone)]
pub struct DatabaseRegistry {
    kv: Arc<dyn KvStore>,
}

impl DatabaseRegistry {
    /// Wraps an already opened registry store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Opens the registry store of `provider`.
    pub fn open(provider: &dyn KvProvider) -> Result<Self> {
        Ok(Self::new(provider.open(DATABASES_STORE_NAME)?))
    }

    /// Inserts or replaces `record`.
    pub fn put_database(&self, record: DatabaseRecord) -> Result<DatabaseMap> {
        if record.name.is_empty() {
            return Err(PenumbraError::Invalid("database name must not be empty"));
        }
        let mut w = self.kv.write()?;
        let mut map = decode_map(w.get(DATABASES_KEY)?)?;
        map.insert(record.name.clone(), record);
        w.put(DATABASES_KEY, &serde_json::to_vec(&map)?)?;
        w.commit()?;
        Ok(map)
    }

    /// Every record.
    pub fn get_databases(&self) -> Result<DatabaseMap> {
        decode_map(self.kv.read()?.get(DATABASES_KEY)?)
    }

    /// Removes the records of `names`. Unknown names are ignored.
    pub fn delete_databases<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Result<()> {
        let mut w = self.kv.write()?;
        let mut map = decode_map(w.get(DATABASES_KEY)?)?;
        for name in names {
            map.remove(name);
        }
        w.put(DATABASES_KEY, &serde_json::to_vec(&map)?)?;
        w.commit()
    }

    /// Stable random id of this installation, created on first use.
    pub fn profile_id(&self) -> Result<String> {
        if let Some(raw) = self.kv.read()?.get(PROFILE_ID_KEY)? {
            return Ok(serde_json::from_slice(&raw)?);
        }
        let mut w = self.kv.write()?;
        if let Some(raw) = w.get(PROFILE_ID_KEY)? {
            return Ok(serde_json::from_slice(&raw)?);
        }
        let id = format!("p{}", random_id());
        w.put(PROFILE_ID_KEY, &serde_json::to_vec(&id)?)?;
        w.commit()?;
        Ok(id)
    }

    /// Closes the registry store.
    pub fn close(&self) -> Result<()> {
        self.kv.close()
    }
}

fn decode_map(raw: Option<Vec<u8>>) -> Result<DatabaseMap> {
    match raw {
        Some(raw) => Ok(serde_json::from_slice(&raw)?),
        None => Ok(DatabaseMap::new()),
    }
}

/// Age limits for [`collect_databases`].
#[derive(Clone, Copy, Debug)]
pub struct CollectLimits {
    /// See [`DATABASE_MAX_AGE`].
    pub max_age: Duration,
    /// See [`BRANCH_DATABASE_MAX_AGE`].
    pub branch_max_age: Duration,
}

impl Default for CollectLimits {
    fn default() -> Self {
        Self {
            max_age: DATABASE_MAX_AGE,
            branch_max_age: BRANCH_DATABASE_MAX_AGE,
        }
    }
}

/// Drops every registered store that is old enough and holds nothing the
/// server still owes an acknowledgement for. Returns the dropped names.
///
/// A failure on one store is logged and does not stop the others; the first
/// such error is returned once all stores were tried.
pub fn collect_databases(
    registry: &DatabaseRegistry,
    provider: &dyn KvProvider,
    now: u64,
    limits: CollectLimits,
) -> Result<Vec<String>> {
    let mut dropped = Vec::new();
    let mut first_err = None;
    for record in registry.get_databases()?.into_values() {
        match can_collect(&record, provider, now, limits) {
            Ok(false) => {}
            Ok(true) => match provider.drop_store(&record.name) {
                Ok(()) => dropped.push(record.name),
                Err(err) => {
                    warn!(database = %record.name, error = %err, "persist.databases.drop_failed");
                    first_err.get_or_insert(err);
                }
            },
            Err(err) => {
                warn!(database = %record.name, error = %err, "persist.databases.check_failed");
                first_err.get_or_insert(err);
            }
        }
    }
    if !dropped.is_empty() {
        registry.delete_databases(dropped.iter().map(String::as_str))?;
        info!(dropped = dropped.len(), "persist.databases.collected");
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(dropped),
    }
}

fn can_collect(
    record: &DatabaseRecord,
    provider: &dyn KvProvider,
    now: u64,
    limits: CollectLimits,
) -> Result<bool> {
    if record.format_version > FORMAT_VERSION {
        return Ok(false);
    }
    let store = DagStore::new(provider.open(&record.name)?);
    match record.last_opened_timestamp_ms {
        Some(opened) => {
            if now.saturating_sub(opened) < limits.branch_max_age.as_millis() as u64 {
                return Ok(false);
            }
            let branches = with_read(&store, |r| get_branches(r))?;
            Ok(!branches.values().any(|b| b.has_pending_mutations()))
        }
        None => {
            let max_age = limits.max_age.as_millis() as u64;
            let clients = with_read(&store, |r| get_clients(r))?;
            Ok(clients
                .values()
                .all(|c| now.saturating_sub(c.heartbeat_timestamp_ms) >= max_age))
        }
    }
}

/// Runs [`collect_databases`] on `schedule` until `shutdown` fires.
pub fn start_collect_databases(
    registry: DatabaseRegistry,
    provider: Arc<dyn KvProvider>,
    limits: CollectLimits,
    schedule: IntervalSchedule,
    shutdown: Shutdown,
) -> Result<JoinHandle<()>> {
    spawn_interval("collect-databases", schedule, shutdown, move |shutdown| {
        shutdown.check()?;
        collect_databases(&registry, &*provider, now_ms(), limits).map(|_| ())
    })
}
