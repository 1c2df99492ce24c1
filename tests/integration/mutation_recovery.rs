#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use penumbra::persist::get_branches;
use penumbra::primitives::kv::{KvProvider, MemKvProvider};
use penumbra::storage::dag::with_read;
use penumbra::sync::BranchRecovery;
use penumbra::types::{BranchId, ClientId};
use penumbra::{PenumbraError, Replica, ReplicaOptions, Result};
use serde_json::json;

use support::{options, put, TestServer};

/// Leaves two persisted, never pushed mutations behind in `provider`.
fn abandon(provider: &Arc<dyn KvProvider>, opts: ReplicaOptions) -> Result<(BranchId, ClientId)> {
    let replica = Replica::open(opts, Arc::clone(provider))?;
    put(&replica, "left/1", json!("a"))?;
    put(&replica, "left/2", json!("b"))?;
    replica.persist()?;
    let ids = (replica.branch_id().clone(), replica.client_id().clone());
    replica.close()?;
    Ok(ids)
}

fn rescuer(server: &Arc<TestServer>, opts: ReplicaOptions, provider: &Arc<dyn KvProvider>) -> Result<Replica> {
    let opts = opts
        .mutator("noop", |_, _| Ok(()))
        .puller(server.clone())
        .pusher(server.clone());
    Replica::open(opts, Arc::clone(provider))
}

#[test]
fn abandoned_branch_in_same_store_is_recovered() -> Result<()> {
    let provider: Arc<dyn KvProvider> = Arc::new(MemKvProvider::new());
    let server = TestServer::new();
    let (branch, client) = abandon(&provider, options("todo"))?;

    let replica = rescuer(&server, options("todo"), &provider)?;
    assert_ne!(replica.branch_id(), &branch);
    let report = replica.recover_mutations()?;
    assert_eq!(report[0].0, replica.database_name());
    assert_eq!(report[0].1, vec![(branch.clone(), BranchRecovery::Recovered)]);
    assert_eq!(server.value("left/2"), Some(json!("b")));
    assert_eq!(server.last_mutation_ids(&branch).get(&client), Some(&2));

    let branches = with_read(&**replica.durable_store(), |r| get_branches(r))?;
    let recovered = branches.get(&branch).ok_or(PenumbraError::Invalid("branch"))?;
    assert!(!recovered.has_pending_mutations());

    let again = replica.recover_mutations()?;
    assert!(again[0].1.is_empty(), "nothing is left to recover");
    assert_eq!(server.pushes(), 1);
    replica.close()
}

#[test]
fn sibling_schema_store_is_recovered() -> Result<()> {
    let provider: Arc<dyn KvProvider> = Arc::new(MemKvProvider::new());
    let server = TestServer::new();
    let (branch, _) = abandon(&provider, options("todo"))?;

    let replica = rescuer(&server, options("todo").schema_version("2"), &provider)?;
    assert_eq!(replica.database_name(), "penumbra-todo-1-2");
    let report = replica.recover_mutations()?;
    let sibling = report
        .iter()
        .find(|(name, _)| name == "penumbra-todo-1-1")
        .ok_or(PenumbraError::Invalid("sibling store was not visited"))?;
    assert_eq!(sibling.1, vec![(branch, BranchRecovery::Recovered)]);
    assert_eq!(server.value("left/1"), Some(json!("a")));
    replica.close()
}

#[test]
fn branch_unknown_to_the_server_is_disabled() -> Result<()> {
    let provider: Arc<dyn KvProvider> = Arc::new(MemKvProvider::new());
    let server = TestServer::new();
    let (branch, _) = abandon(&provider, options("todo"))?;
    server.forget(&branch);

    let replica = rescuer(&server, options("todo"), &provider)?;
    let report = replica.recover_mutations()?;
    assert_eq!(report[0].1, vec![(branch.clone(), BranchRecovery::Disabled)]);
    let branches = with_read(&**replica.durable_store(), |r| get_branches(r))?;
    assert!(branches.get(&branch).is_some_and(|b| b.disabled));
    assert_eq!(server.value("left/1"), None);

    let again = replica.recover_mutations()?;
    assert!(again[0].1.is_empty(), "disabled branches are skipped");
    replica.close()
}

#[test]
fn own_branch_is_left_to_the_client() -> Result<()> {
    let provider: Arc<dyn KvProvider> = Arc::new(MemKvProvider::new());
    let server = TestServer::new();
    let replica = rescuer(&server, options("todo"), &provider)?;
    put(&replica, "mine", json!(1))?;
    replica.persist()?;
    let report = replica.recover_mutations()?;
    assert!(report.iter().all(|(_, branches)| branches.is_empty()));
    assert_eq!(server.pushes(), 0);
    replica.close()
}
