use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::persist::{
    CollectLimits, CLIENT_MAX_INACTIVE, COLLECT_DELAY, COLLECT_INTERVAL, GC_INTERVAL,
    HEARTBEAT_INTERVAL,
};
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::DEFAULT_LAZY_CACHE_BYTES;
use crate::storage::db::{IndexDefinition, IndexDefinitions, Mutators, WriteTransaction};
use crate::sync::{AuthProvider, Puller, Pusher};
use crate::types::{ChunkHasher, Result};

/// Interval between mutation recovery runs.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval between background persists of the working store.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between background refreshes from the durable store.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between gathering durable chunks and installing them during a refresh.
pub const REFRESH_SETTLE: Duration = Duration::from_millis(300);

/// Timing of the background processes a replica runs.
#[derive(Clone, Copy, Debug)]
pub struct BackgroundOptions {
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Client GC period.
    pub client_gc_interval: Duration,
    /// Clients without a heartbeat for this long are collected.
    pub client_max_inactive: Duration,
    /// Branch GC period.
    pub branch_gc_interval: Duration,
    /// Delay before the first database collection.
    pub collect_delay: Duration,
    /// Database collection period.
    pub collect_interval: Duration,
    /// Database collection age limits.
    pub collect_limits: CollectLimits,
    /// Mutation recovery period. Recovery also needs a puller and a pusher.
    pub recovery_interval: Duration,
    /// Persist period.
    pub persist_interval: Duration,
    /// Refresh period.
    pub refresh_interval: Duration,
}

impl Default for BackgroundOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            client_gc_interval: GC_INTERVAL,
            client_max_inactive: CLIENT_MAX_INACTIVE,
            branch_gc_interval: GC_INTERVAL,
            collect_delay: COLLECT_DELAY,
            collect_interval: COLLECT_INTERVAL,
            collect_limits: CollectLimits::default(),
            recovery_interval: RECOVERY_INTERVAL,
            persist_interval: PERSIST_INTERVAL,
            refresh_interval: REFRESH_INTERVAL,
        }
    }
}

/// Configuration of a [`Replica`](super::Replica).
///
/// Built with chained setters:
///
/// ```
/// use penumbra::replica::ReplicaOptions;
///
/// let opts = ReplicaOptions::new("todo")
///     .schema_version("3")
///     .mutator("put", |tx, args| {
///         let key = args["key"].as_str().unwrap_or_default().to_string();
///         tx.put(&key, args["value"].clone())
///     });
/// assert_eq!(opts.name, "todo");
/// ```
pub struct ReplicaOptions {
    /// Application name; together with the schema version it names the store.
    pub name: String,
    /// Application schema version.
    pub schema_version: String,
    /// Registered mutators.
    pub mutators: Mutators,
    /// Secondary indexes.
    pub indexes: IndexDefinitions,
    /// Pull transport.
    pub puller: Option<Arc<dyn Puller>>,
    /// Push transport.
    pub pusher: Option<Arc<dyn Pusher>>,
    /// Initial auth token.
    pub auth: String,
    /// Renews the token after a 401.
    pub auth_provider: Option<Box<dyn AuthProvider>>,
    /// B-tree node sizes.
    pub btree: BTreeOptions,
    /// Byte budget of the working store's cache of durable chunks.
    pub lazy_cache_bytes: usize,
    /// Hash function of the working store's chunks.
    pub hasher: ChunkHasher,
    /// See [`REFRESH_SETTLE`].
    pub refresh_settle: Duration,
    /// Background processes to run; `None` runs none.
    pub background: Option<BackgroundOptions>,
}

impl ReplicaOptions {
    /// Defaults for application `name`: empty schema version, no mutators,
    /// no transports and no background processes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: String::new(),
            mutators: Mutators::new(),
            indexes: IndexDefinitions::new(),
            puller: None,
            pusher: None,
            auth: String::new(),
            auth_provider: None,
            btree: BTreeOptions::default(),
            lazy_cache_bytes: DEFAULT_LAZY_CACHE_BYTES,
            hasher: ChunkHasher::Content,
            refresh_settle: REFRESH_SETTLE,
            background: None,
        }
    }

    /// Sets the schema version.
    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// Registers mutator `name`.
    pub fn mutator<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.mutators.insert(name.into(), Arc::new(f));
        self
    }

    /// Declares index `name`.
    pub fn index(mut self, name: impl Into<String>, definition: IndexDefinition) -> Self {
        self.indexes.insert(name.into(), definition);
        self
    }

    /// Sets the pull transport.
    pub fn puller(mut self, puller: Arc<dyn Puller>) -> Self {
        self.puller = Some(puller);
        self
    }

    /// Sets the push transport.
    pub fn pusher(mut self, pusher: Arc<dyn Pusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Sets the auth token and the provider renewing it.
    pub fn auth(mut self, token: impl Into<String>, provider: Option<Box<dyn AuthProvider>>) -> Self {
        self.auth = token.into();
        self.auth_provider = provider;
        self
    }

    /// Sets the B-tree node sizes.
    pub fn btree(mut self, btree: BTreeOptions) -> Self {
        self.btree = btree;
        self
    }

    /// Sets the working store cache budget.
    pub fn lazy_cache_bytes(mut self, bytes: usize) -> Self {
        self.lazy_cache_bytes = bytes;
        self
    }

    /// Sets the working store hash function.
    pub fn hasher(mut self, hasher: ChunkHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Sets the refresh settle delay.
    pub fn refresh_settle(mut self, settle: Duration) -> Self {
        self.refresh_settle = settle;
        self
    }

    /// Runs background processes with `background` timing.
    pub fn background(mut self, background: BackgroundOptions) -> Self {
        self.background = Some(background);
        self
    }
}

impl fmt::Debug for ReplicaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaOptions")
            .field("name", &self.name)
            .field("schema_version", &self.schema_version)
            .field("mutators", &self.mutators.keys().collect::<Vec<_>>())
            .field("indexes", &self.indexes)
            .field("puller", &self.puller.is_some())
            .field("pusher", &self.pusher.is_some())
            .field("btree", &self.btree)
            .field("lazy_cache_bytes", &self.lazy_cache_bytes)
            .field("background", &self.background)
            .finish()
    }
}
