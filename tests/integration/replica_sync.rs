#![allow(missing_docs)]

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use penumbra::primitives::kv::MemKvProvider;
use penumbra::sync::PullResponse;
use penumbra::{PenumbraError, Replica, Result};
use serde_json::json;

use support::{get, options, put, TestServer};

fn open(server: &Arc<TestServer>) -> Result<Replica> {
    let opts = options("todo").puller(server.clone()).pusher(server.clone());
    Replica::open(opts, Arc::new(MemKvProvider::new()))
}

#[test]
fn changes_travel_between_installations() -> Result<()> {
    let server = TestServer::new();
    let a = open(&server)?;
    let b = open(&server)?;
    assert_ne!(a.branch_id(), b.branch_id());

    put(&a, "todo/1", json!({"title": "write tests"}))?;
    put(&a, "todo/2", json!({"title": "ship"}))?;
    assert!(a.push()?.is_some());
    assert_eq!(server.pushed_mutations(), 2);
    assert_eq!(server.value("todo/2"), Some(json!({"title": "ship"})));

    let outcome = b.pull()?;
    assert!(matches!(outcome.response, Some(PullResponse::Ok(_))));
    assert!(outcome.applied.is_some());
    assert_eq!(get(&b, "todo/1")?, Some(json!({"title": "write tests"})));

    let outcome = a.pull()?;
    assert!(outcome.applied.is_some());
    assert!(a.push()?.is_none(), "acknowledged mutations are not pushed again");

    a.close()?;
    b.close()
}

#[test]
fn unacknowledged_mutations_survive_a_pull() -> Result<()> {
    let server = TestServer::new();
    let replica = open(&server)?;

    put(&replica, "a", json!(1))?;
    replica.push()?;
    put(&replica, "b", json!(2))?;
    replica.pull()?;

    assert_eq!(get(&replica, "a")?, Some(json!(1)));
    assert_eq!(get(&replica, "b")?, Some(json!(2)));
    assert_eq!(server.value("b"), None);

    assert!(replica.push()?.is_some());
    assert_eq!(server.value("b"), Some(json!(2)));
    assert_eq!(server.last_mutation_ids(replica.branch_id()).get(replica.client_id()), Some(&2));
    replica.close()
}

#[test]
fn repeated_pull_without_news_changes_nothing() -> Result<()> {
    let server = TestServer::new();
    let replica = open(&server)?;
    replica.pull()?;
    let head = replica.head()?;
    let outcome = replica.pull()?;
    assert!(outcome.applied.is_none());
    assert_eq!(replica.head()?, head);
    assert_eq!(server.pulls(), 2);
    replica.close()
}

#[test]
fn deletes_propagate() -> Result<()> {
    let server = TestServer::new();
    let a = open(&server)?;
    let b = open(&server)?;
    put(&a, "gone", json!(true))?;
    a.push()?;
    b.pull()?;
    assert_eq!(get(&b, "gone")?, Some(json!(true)));

    a.mutate("del", json!({"key": "gone"}))?;
    a.push()?;
    let changed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changed);
    b.subscribe("gone", move |ops| {
        counter.fetch_add(ops.len(), Ordering::SeqCst);
    });
    b.pull()?;
    assert_eq!(get(&b, "gone")?, None);
    assert_eq!(changed.load(Ordering::SeqCst), 1);
    a.close()?;
    b.close()
}

#[test]
fn forgotten_branch_reports_client_state_not_found() -> Result<()> {
    let server = TestServer::new();
    let replica = open(&server)?;
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    replica.on_client_state_not_found(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.forget(replica.branch_id());

    let outcome = replica.pull()?;
    assert_eq!(outcome.response, Some(PullResponse::ClientStateNotFound));
    assert!(outcome.applied.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    put(&replica, "k", json!(1))?;
    replica.push()?;
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    replica.close()?;
    assert!(matches!(replica.pull(), Err(PenumbraError::Closed)));
    Ok(())
}
