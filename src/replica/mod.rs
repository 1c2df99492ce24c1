//! Application facade.
//!
//! A [`Replica`] owns one client of a durable store: it registers the store
//! and the client, keeps a working store seeded from the client's branch,
//! runs mutators against it and drives persist, refresh, pull, push and
//! mutation recovery. Background processes share one [`Shutdown`] signal
//! that [`Replica::close`] fires.
#![forbid(unsafe_code)]

mod background;
mod options;
mod subscriptions;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info};

pub use options::{
    BackgroundOptions, ReplicaOptions, PERSIST_INTERVAL, RECOVERY_INTERVAL, REFRESH_INTERVAL,
    REFRESH_SETTLE,
};
pub use subscriptions::{SubscriptionCallback, SubscriptionId};

use crate::persist::{
    assert_has_client_state, database_name, init_client, persist, refresh, DatabaseRecord,
    DatabaseRegistry, RefreshOptions, FORMAT_VERSION,
};
use crate::primitives::concurrency::Shutdown;
use crate::primitives::kv::KvProvider;
use crate::storage::btree::{BTreeOptions, DiffOperation};
use crate::storage::dag::{with_read, with_write, DagStore, LazyStore, Store};
use crate::storage::db::{
    commit_from_head, MutationInfo, Mutators, Read, Write, WriteTransaction, DEFAULT_HEAD_NAME,
};
use crate::sync::{
    pull, push, recover_mutations, recover_mutations_in_databases, Auth, BranchRecovery,
    PullContext, PullOutcome, PullResponse, Puller, PushContext, PushResponse, Pusher,
    PusherResult, RecoveryContext,
};
use crate::types::{now_ms, BranchId, ClientId, Hash, PenumbraError, Result};
use subscriptions::Subscriptions;

type StateNotFoundCallback = Arc<dyn Fn() + Send + Sync>;

/// Recovery outcomes per store name.
pub type RecoveryReport = Vec<(String, Vec<(BranchId, BranchRecovery)>)>;

/// One running client of a durable store.
pub struct Replica {
    inner: Arc<ReplicaInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct ReplicaInner {
    app_name: String,
    database: String,
    schema_version: String,
    profile_id: String,
    client_id: ClientId,
    branch_id: BranchId,
    provider: Arc<dyn KvProvider>,
    registry: DatabaseRegistry,
    perdag: Arc<dyn Store>,
    memdag: LazyStore,
    mutators: Mutators,
    btree: BTreeOptions,
    refresh_settle: Duration,
    puller: Option<Arc<dyn Puller>>,
    pusher: Option<Arc<dyn Pusher>>,
    auth: Auth,
    subscriptions: Subscriptions,
    on_client_state_not_found: RwLock<Option<StateNotFoundCallback>>,
    shutdown: Shutdown,
}

impl Replica {
    /// Opens the store of `options.name` and `options.schema_version` from
    /// `provider` and registers a new client in it.
    ///
    /// The client joins a compatible branch, forks the newest snapshot or
    /// starts a fresh branch, in that order of preference. Background
    /// processes start when `options.background` is set.
    pub fn open(options: ReplicaOptions, provider: Arc<dyn KvProvider>) -> Result<Self> {
        if options.name.is_empty() {
            return Err(PenumbraError::Invalid("replica name must not be empty"));
        }
        let registry = DatabaseRegistry::open(&*provider)?;
        let profile_id = registry.profile_id()?;
        let database = database_name(&options.name, &options.schema_version);
        registry.put_database(DatabaseRecord {
            name: database.clone(),
            app_name: options.name.clone(),
            format_version: FORMAT_VERSION,
            schema_version: options.schema_version.clone(),
            last_opened_timestamp_ms: Some(now_ms()),
        })?;

        let perdag: Arc<dyn Store> = Arc::new(DagStore::new(provider.open(&database)?));
        let mutator_names: BTreeSet<String> = options.mutators.keys().cloned().collect();
        let init = init_client(&*perdag, &mutator_names, &options.indexes, options.btree)?;

        let memdag = LazyStore::new(Arc::clone(&perdag), options.lazy_cache_bytes, options.hasher);
        with_write(&memdag, |w| {
            w.set_head(DEFAULT_HEAD_NAME, init.head_hash)?;
            w.commit()
        })?;
        info!(
            database = %database,
            client = %init.client_id,
            branch = %init.client.branch_id,
            new_branch = init.new_branch,
            "replica.open"
        );

        let inner = Arc::new(ReplicaInner {
            app_name: options.name,
            database,
            schema_version: options.schema_version,
            profile_id,
            client_id: init.client_id,
            branch_id: init.client.branch_id,
            provider,
            registry,
            perdag,
            memdag,
            mutators: options.mutators,
            btree: options.btree,
            refresh_settle: options.refresh_settle,
            puller: options.puller,
            pusher: options.pusher,
            auth: Auth::new(options.auth, options.auth_provider),
            subscriptions: Subscriptions::default(),
            on_client_state_not_found: RwLock::new(None),
            shutdown: Shutdown::new(),
        });
        let replica = Self {
            inner,
            workers: Mutex::new(Vec::new()),
        };
        if let Some(background) = options.background {
            let handles = background::start(&replica.inner, &background)?;
            replica.workers.lock().extend(handles);
        }
        Ok(replica)
    }

    /// This replica's client.
    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Branch the client belongs to.
    pub fn branch_id(&self) -> &BranchId {
        &self.inner.branch_id
    }

    /// Stable id of this installation.
    pub fn profile_id(&self) -> &str {
        &self.inner.profile_id
    }

    /// Name of the durable store.
    pub fn database_name(&self) -> &str {
        &self.inner.database
    }

    /// The durable store.
    pub fn durable_store(&self) -> &Arc<dyn Store> {
        &self.inner.perdag
    }

    /// Current head of the working main map.
    pub fn head(&self) -> Result<Hash> {
        self.inner.ensure_open()?;
        with_read(&self.inner.memdag, |r| r.must_get_head(DEFAULT_HEAD_NAME))
    }

    /// Runs mutator `name` with `args` as a new local commit on main and
    /// notifies subscribers. Returns the new head.
    pub fn mutate(&self, name: &str, args: Value) -> Result<Hash> {
        self.inner.mutate(name, args)
    }

    /// Runs `f` against the current main map.
    pub fn query<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Read<'_>) -> Result<R>,
    {
        self.inner.ensure_open()?;
        with_read(&self.inner.memdag, |r| {
            let read = Read::new(r, commit_from_head(DEFAULT_HEAD_NAME, r)?);
            f(&read)
        })
    }

    /// Pulls from the server and, if that moved main, notifies subscribers.
    pub fn pull(&self) -> Result<PullOutcome> {
        self.inner.pull()
    }

    /// Pushes pending local mutations. `None` when nothing was pending.
    pub fn push(&self) -> Result<Option<PusherResult>> {
        self.inner.push()
    }

    /// Promotes the working store into the client's branch.
    pub fn persist(&self) -> Result<()> {
        self.inner.persist()
    }

    /// Brings branch progress made by other clients into the working store.
    /// Returns whether the main map changed.
    pub fn refresh(&self) -> Result<bool> {
        self.inner.refresh()
    }

    /// Pushes and confirms mutations other clients left behind, in this
    /// store and in sibling stores of the same application.
    pub fn recover_mutations(&self) -> Result<RecoveryReport> {
        self.inner.recover_mutations()
    }

    /// Calls `callback` with the main-map changes under `prefix` each time
    /// main moves.
    pub fn subscribe<F>(&self, prefix: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&[DiffOperation]) + Send + Sync + 'static,
    {
        self.inner.subscriptions.add(prefix.into(), Arc::new(callback))
    }

    /// Stops a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscriptions.remove(id)
    }

    /// Sets the callback run when this client's durable state turns out to
    /// be gone, either collected locally or unknown to the server.
    pub fn on_client_state_not_found<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_client_state_not_found.write() = Some(Arc::new(callback));
    }

    /// Fires the client-state-not-found callback if this client's registry
    /// entry is gone. Returns whether it is gone.
    pub fn check_client_state(&self) -> Result<bool> {
        self.inner.ensure_open()?;
        let missing = with_read(&*self.inner.perdag, |r| {
            match assert_has_client_state(&self.inner.client_id, r) {
                Ok(()) => Ok(false),
                Err(err) if err.is_client_state_not_found() => Ok(true),
                Err(err) => Err(err),
            }
        })?;
        if missing {
            self.inner.fire_client_state_not_found();
        }
        Ok(missing)
    }

    /// Whether [`close`](Self::close) ran.
    pub fn closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }

    /// Stops background processes and closes the stores. Operations still
    /// running fail with `Closed` without writing a new head.
    pub fn close(&self) -> Result<()> {
        if self.inner.shutdown.is_triggered() {
            return Ok(());
        }
        self.inner.shutdown.trigger();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("replica.worker.panicked");
            }
        }
        self.inner.subscriptions.clear();
        self.inner.memdag.close()?;
        self.inner.perdag.close()?;
        self.inner.registry.close()?;
        info!(database = %self.inner.database, client = %self.inner.client_id, "replica.closed");
        Ok(())
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.inner.shutdown.trigger();
    }
}

impl ReplicaInner {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(PenumbraError::Closed);
        }
        Ok(())
    }

    pub(crate) fn fire_client_state_not_found(&self) {
        error!(client = %self.client_id, "replica.client_state_not_found");
        let callback = self.on_client_state_not_found.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Fires the callback for registry-not-found errors and passes `result` on.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_client_state_not_found() {
                self.fire_client_state_not_found();
            }
        }
        result
    }

    fn mutate(&self, name: &str, args: Value) -> Result<Hash> {
        self.ensure_open()?;
        let mutator = self
            .mutators
            .get(name)
            .cloned()
            .ok_or_else(|| PenumbraError::InvalidArgument(format!("unknown mutator {name}")))?;
        let (head, diffs) = with_write(&self.memdag, |w| {
            let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
            let info = MutationInfo {
                client_id: self.client_id.clone(),
                mutator_name: name.to_string(),
                mutator_args: args.clone(),
                original_hash: None,
                timestamp: now_ms(),
            };
            let mut write = Write::new_local(w, basis, info, self.btree)?;
            {
                let mut tx = WriteTransaction::new(&mut write)?;
                mutator(&mut tx, &args)?;
            }
            write.commit_with_diffs(DEFAULT_HEAD_NAME)
        })?;
        debug!(mutator = name, head = %head, "replica.mutate");
        self.subscriptions.fire(&diffs);
        Ok(head)
    }

    fn pull(&self) -> Result<PullOutcome> {
        self.ensure_open()?;
        let puller = self
            .puller
            .as_deref()
            .ok_or(PenumbraError::Invalid("no puller configured"))?;
        let ctx = PullContext {
            profile_id: &self.profile_id,
            branch_id: &self.branch_id,
            client_id: &self.client_id,
            schema_version: &self.schema_version,
            puller,
            auth: &self.auth,
            opts: self.btree,
            shutdown: &self.shutdown,
        };
        let outcome = pull(&ctx, &self.memdag, &self.mutators)?;
        if let Some(PullResponse::ClientStateNotFound) = outcome.response {
            self.fire_client_state_not_found();
        }
        if let Some((_, diffs)) = &outcome.applied {
            self.subscriptions.fire(diffs);
        }
        Ok(outcome)
    }

    fn push(&self) -> Result<Option<PusherResult>> {
        self.ensure_open()?;
        let pusher = self
            .pusher
            .as_deref()
            .ok_or(PenumbraError::Invalid("no pusher configured"))?;
        let ctx = PushContext {
            profile_id: &self.profile_id,
            branch_id: &self.branch_id,
            schema_version: &self.schema_version,
            pusher,
            auth: &self.auth,
        };
        let result = push(&ctx, &self.memdag)?;
        if let Some(PusherResult {
            response: Some(PushResponse::ClientStateNotFound),
            ..
        }) = &result
        {
            self.fire_client_state_not_found();
        }
        Ok(result)
    }

    pub(crate) fn persist(&self) -> Result<()> {
        self.ensure_open()?;
        let result = persist(
            &self.client_id,
            &self.memdag,
            &*self.perdag,
            &self.mutators,
            self.btree,
            &self.shutdown,
        );
        self.observe(result)
    }

    pub(crate) fn refresh(&self) -> Result<bool> {
        self.ensure_open()?;
        let opts = RefreshOptions {
            btree: self.btree,
            settle: self.refresh_settle,
        };
        let result = refresh(
            &self.client_id,
            &self.memdag,
            &*self.perdag,
            &self.mutators,
            opts,
            &self.shutdown,
        );
        match self.observe(result)? {
            Some((_, diffs)) => {
                self.subscriptions.fire(&diffs);
                Ok(!diffs.is_empty())
            }
            None => Ok(false),
        }
    }

    pub(crate) fn recover_mutations(&self) -> Result<RecoveryReport> {
        self.ensure_open()?;
        let (Some(puller), Some(pusher)) = (self.puller.as_deref(), self.pusher.as_deref()) else {
            return Err(PenumbraError::Invalid("recovery needs a puller and a pusher"));
        };
        let ctx = RecoveryContext {
            profile_id: &self.profile_id,
            schema_version: &self.schema_version,
            own_branch: Some(&self.branch_id),
            puller,
            pusher,
            auth: &self.auth,
            opts: self.btree,
            shutdown: &self.shutdown,
        };
        let mut report = vec![(self.database.clone(), recover_mutations(&self.perdag, &ctx)?)];
        report.extend(recover_mutations_in_databases(
            &self.registry,
            &*self.provider,
            &self.app_name,
            &self.database,
            &ctx,
        )?);
        Ok(report)
    }

    pub(crate) fn can_recover(&self) -> bool {
        self.puller.is_some() && self.pusher.is_some()
    }
}
