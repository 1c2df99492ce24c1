#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use penumbra::storage::btree::BTreeOptions;
use penumbra::sync::{
    HttpRequestInfo, PatchOperation, PullRequest, PullResponse, PullResponseOk, Puller,
    PullerResult, PushRequest, PushResponse, Pusher, PusherResult,
};
use penumbra::types::{BranchId, MutationIds};
use penumbra::{Replica, ReplicaOptions, Result};
use serde_json::{json, Value};

/// Replica options with `put` and `del` mutators and small tree nodes.
pub fn options(app: &str) -> ReplicaOptions {
    ReplicaOptions::new(app)
        .schema_version("1")
        .btree(BTreeOptions::with_sizes(256, 512))
        .refresh_settle(Duration::ZERO)
        .mutator("put", |tx, args| {
            let key = args["key"].as_str().unwrap_or_default().to_string();
            tx.put(&key, args["value"].clone())
        })
        .mutator("del", |tx, args| {
            let key = args["key"].as_str().unwrap_or_default().to_string();
            tx.del(&key).map(|_| ())
        })
}

pub fn put(replica: &Replica, key: &str, value: Value) -> Result<()> {
    replica.mutate("put", json!({"key": key, "value": value}))?;
    Ok(())
}

pub fn get(replica: &Replica, key: &str) -> Result<Option<Value>> {
    replica.query(|read| read.get(key))
}

#[derive(Default)]
struct ServerState {
    version: u64,
    data: BTreeMap<String, Value>,
    lmids: BTreeMap<BranchId, MutationIds>,
}

/// In-process server applying pushed `put`/`del` mutations in order and
/// answering pulls with a full reset patch.
#[derive(Default)]
pub struct TestServer {
    state: Mutex<ServerState>,
    forgotten: Mutex<BTreeSet<BranchId>>,
    pulls: AtomicUsize,
    pushes: AtomicUsize,
    pushed_mutations: AtomicUsize,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.state.lock().data.get(key).cloned()
    }

    pub fn last_mutation_ids(&self, branch: &BranchId) -> MutationIds {
        self.state.lock().lmids.get(branch).cloned().unwrap_or_default()
    }

    /// Makes the server answer `ClientStateNotFound` for `branch`.
    pub fn forget(&self, branch: &BranchId) {
        self.forgotten.lock().insert(branch.clone());
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn pushes(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn pushed_mutations(&self) -> usize {
        self.pushed_mutations.load(Ordering::SeqCst)
    }

    fn forgotten(&self, branch: &BranchId) -> bool {
        self.forgotten.lock().contains(branch)
    }
}

impl Puller for TestServer {
    fn pull(&self, request: &PullRequest, _auth: &str, _request_id: &str) -> Result<PullerResult> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.forgotten(&request.branch_id) {
            return Ok(PullerResult {
                response: Some(PullResponse::ClientStateNotFound),
                http_request_info: HttpRequestInfo::ok(),
            });
        }
        let state = self.state.lock();
        let mut patch = Vec::new();
        if request.cookie != json!(state.version) {
            patch.push(PatchOperation::Clear);
            patch.extend(state.data.iter().map(|(key, value)| PatchOperation::Put {
                key: key.clone(),
                value: value.clone(),
            }));
        }
        Ok(PullerResult {
            response: Some(PullResponse::Ok(PullResponseOk {
                cookie: json!(state.version),
                last_mutation_id_changes: state.lmids.get(&request.branch_id).cloned().unwrap_or_default(),
                patch,
            })),
            http_request_info: HttpRequestInfo::ok(),
        })
    }
}

impl Pusher for TestServer {
    fn push(&self, request: &PushRequest, _auth: &str, _request_id: &str) -> Result<PusherResult> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        if self.forgotten(&request.branch_id) {
            return Ok(PusherResult {
                response: Some(PushResponse::ClientStateNotFound),
                http_request_info: HttpRequestInfo::ok(),
            });
        }
        let mut state = self.state.lock();
        let state = &mut *state;
        let lmids = state.lmids.entry(request.branch_id.clone()).or_default();
        for mutation in &request.mutations {
            let last = lmids.get(&mutation.client_id).copied().unwrap_or(0);
            if mutation.id != last + 1 {
                continue;
            }
            let key = mutation.args["key"].as_str().unwrap_or_default().to_string();
            match mutation.name.as_str() {
                "put" => {
                    state.data.insert(key, mutation.args["value"].clone());
                }
                "del" => {
                    state.data.remove(&key);
                }
                _ => {}
            }
            lmids.insert(mutation.client_id.clone(), mutation.id);
            state.version += 1;
            self.pushed_mutations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(PusherResult {
            response: None,
            http_request_info: HttpRequestInfo::ok(),
        })
    }
}
