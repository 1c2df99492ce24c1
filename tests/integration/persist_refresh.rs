#![allow(missing_docs)]

mod support;

use std::sync::Arc;

use parking_lot::Mutex;
use penumbra::persist::{get_branches, get_clients};
use penumbra::primitives::kv::MemKvProvider;
use penumbra::storage::dag::with_read;
use penumbra::{Replica, Result};
use serde_json::json;

use support::{get, options, put};

#[test]
fn clients_of_one_installation_share_a_branch() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let a = Replica::open(options("notes"), provider.clone())?;
    let b = Replica::open(options("notes"), provider.clone())?;
    assert_eq!(a.branch_id(), b.branch_id());

    let (clients, branches) = with_read(&**a.durable_store(), |r| Ok((get_clients(r)?, get_branches(r)?)))?;
    assert_eq!(clients.len(), 2);
    assert_eq!(branches.len(), 1);

    put(&a, "n/1", json!("first"))?;
    put(&b, "n/2", json!("second"))?;
    a.persist()?;
    b.persist()?;
    assert!(a.refresh()?);
    assert!(b.refresh()?);
    assert_eq!(get(&a, "n/2")?, Some(json!("second")));
    assert_eq!(get(&b, "n/1")?, Some(json!("first")));

    let branch = with_read(&**a.durable_store(), |r| get_branches(r))?
        .remove(a.branch_id())
        .ok_or(penumbra::PenumbraError::Invalid("branch"))?;
    assert_eq!(branch.mutation_ids.get(a.client_id()), Some(&1));
    assert_eq!(branch.mutation_ids.get(b.client_id()), Some(&1));
    assert!(branch.has_pending_mutations());

    a.close()?;
    b.close()
}

#[test]
fn refresh_notifies_subscribers_once() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let writer = Replica::open(options("notes"), provider.clone())?;
    let reader = Replica::open(options("notes"), provider)?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    reader.subscribe("n/", move |ops| {
        sink.lock().extend(ops.iter().map(|op| op.key().to_string()));
    });

    put(&writer, "n/1", json!(1))?;
    put(&writer, "other", json!(1))?;
    writer.persist()?;
    assert!(reader.refresh()?);
    assert!(!reader.refresh()?);
    assert_eq!(*seen.lock(), vec!["n/1".to_string()]);

    writer.close()?;
    reader.close()
}

#[test]
fn different_mutators_get_different_branches() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let a = Replica::open(options("notes"), provider.clone())?;
    let b = Replica::open(options("notes").mutator("noop", |_, _| Ok(())), provider)?;
    assert_ne!(a.branch_id(), b.branch_id());

    put(&a, "only-a", json!(true))?;
    a.persist()?;
    assert!(!b.refresh()?);
    assert_eq!(get(&b, "only-a")?, None);
    a.close()?;
    b.close()
}

#[test]
fn reopened_client_starts_from_the_branch() -> Result<()> {
    let provider = Arc::new(MemKvProvider::new());
    let first = Replica::open(options("notes"), provider.clone())?;
    put(&first, "kept", json!("yes"))?;
    put(&first, "lost", json!("never persisted"))?;
    first.mutate("del", json!({"key": "lost"}))?;
    first.persist()?;
    put(&first, "unsaved", json!(1))?;
    first.close()?;

    let second = Replica::open(options("notes"), provider)?;
    assert_ne!(second.client_id(), first.client_id());
    assert_eq!(second.branch_id(), first.branch_id());
    assert_eq!(get(&second, "kept")?, Some(json!("yes")));
    assert_eq!(get(&second, "lost")?, None);
    assert_eq!(get(&second, "unsaved")?, None);
    second.close()
}
