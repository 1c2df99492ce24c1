use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::primitives::kv::{KvProvider, MemKvProvider};
use crate::storage::btree::BTreeOptions;
use crate::storage::dag::{
    with_read, with_write, DagStore, LazyStore, Store, DEFAULT_LAZY_CACHE_BYTES,
};
use crate::storage::db::{
    commit_from_hash, commit_from_head, IndexDefinitions, MutationInfo, Mutator, Mutators, Read,
    Write, WriteTransaction, DEFAULT_HEAD_NAME,
};
use crate::types::{ChunkHasher, ClientId, Hash, MutationIds, PenumbraError, Result};

fn opts() -> BTreeOptions {
    BTreeOptions::with_sizes(200, 400)
}

fn refresh_opts() -> RefreshOptions {
    RefreshOptions {
        btree: opts(),
        settle: Duration::ZERO,
    }
}

fn mutator<F>(f: F) -> Mutator
where
    F: Fn(&mut WriteTransaction<'_, '_>, &Value) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn mutators() -> Mutators {
    let mut mutators = Mutators::new();
    mutators.insert(
        "put".to_string(),
        mutator(|tx, args| {
            let key = args["key"].as_str().unwrap_or_default().to_string();
            tx.put(&key, args["value"].clone())
        }),
    );
    mutators
}

fn mutator_names() -> BTreeSet<String> {
    mutators().keys().cloned().collect()
}

fn durable() -> Result<Arc<DagStore>> {
    Ok(Arc::new(DagStore::new(MemKvProvider::new().open("durable")?)))
}

/// Registers a client and a working store seeded from its branch head.
fn open_client(perdag: &Arc<DagStore>) -> Result<(ClientId, LazyStore)> {
    let init = init_client(&**perdag, &mutator_names(), &IndexDefinitions::new(), opts())?;
    let source: Arc<dyn Store> = perdag.clone();
    let memdag = LazyStore::new(source, DEFAULT_LAZY_CACHE_BYTES, ChunkHasher::Content);
    with_write(&memdag, |w| {
        w.set_head(DEFAULT_HEAD_NAME, init.head_hash)?;
        w.commit()
    })?;
    Ok((init.client_id, memdag))
}

fn put(memdag: &LazyStore, client: &ClientId, key: &str, value: Value) -> Result<Hash> {
    let args = json!({"key": key, "value": value});
    let mutators = mutators();
    with_write(memdag, |w| {
        let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
        let info = MutationInfo {
            client_id: client.clone(),
            mutator_name: "put".to_string(),
            mutator_args: args.clone(),
            original_hash: None,
            timestamp: 7,
        };
        let mut write = Write::new_local(w, basis, info, opts())?;
        if let Some(m) = mutators.get("put") {
            let mut tx = WriteTransaction::new(&mut write)?;
            m(&mut tx, &args)?;
        }
        write.commit(DEFAULT_HEAD_NAME)
    })
}

fn branch_of(perdag: &DagStore, client: &ClientId) -> Result<Branch> {
    with_read(perdag, |r| Ok(must_get_branch_for_client(client, r)?.1))
}

fn value_at(store: &dyn Store, head: Hash, key: &str) -> Result<Option<Value>> {
    with_read(store, |r| Read::new(r, commit_from_hash(&head, r)?).get(key))
}

fn persist_now(client: &ClientId, memdag: &LazyStore, perdag: &DagStore) -> Result<()> {
    persist(client, memdag, perdag, &mutators(), opts(), &Shutdown::new())
}

/// Points the branch of `client` at a new snapshot on top of its head.
fn durable_snapshot(perdag: &DagStore, client: &ClientId, cookie: Value) -> Result<Hash> {
    with_write(perdag, |w| {
        let (branch_id, mut branch) = must_get_branch_for_client(client, w.as_read())?;
        let commit =
            Write::new_snapshot(w, branch.head_hash, MutationIds::new(), cookie, opts())?.put_commit()?;
        branch.head_hash = commit.hash();
        set_branch(&branch_id, branch, w)?;
        w.commit()?;
        Ok(commit.hash())
    })
}

fn working_snapshot(memdag: &LazyStore, lmids: MutationIds, cookie: Value, data: &[(&str, Value)]) -> Result<Hash> {
    with_write(memdag, |w| {
        let basis = w.must_get_head(DEFAULT_HEAD_NAME)?;
        let mut write = Write::new_snapshot(w, basis, lmids, cookie, opts())?;
        for (k, v) in data {
            write.put(k, v.clone())?;
        }
        write.commit(DEFAULT_HEAD_NAME)
    })
}

#[test]
fn persist_promotes_local_mutations() -> Result<()> {
    let perdag = durable()?;
    let (client, memdag) = open_client(&perdag)?;
    let base = with_read(&memdag, |r| r.must_get_head(DEFAULT_HEAD_NAME))?;
    put(&memdag, &client, "a", json!(1))?;
    let working_head = put(&memdag, &client, "b", json!(2))?;

    persist_now(&client, &memdag, &perdag)?;

    let branch = branch_of(&perdag, &client)?;
    assert_eq!(branch.mutation_ids.get(&client), Some(&2));
    assert!(branch.has_pending_mutations());
    assert_eq!(value_at(&*perdag, branch.head_hash, "a")?, Some(json!(1)));
    assert_eq!(value_at(&*perdag, branch.head_hash, "b")?, Some(json!(2)));
    let stored = with_read(&*perdag, |r| must_get_client(&client, r))?;
    // The client keeps pinning the commit its working store is based on.
    assert_eq!(stored.head_hash, base);

    // The working store keeps its own chain.
    let head = with_read(&memdag, |r| r.must_get_head(DEFAULT_HEAD_NAME))?;
    assert_eq!(head, working_head);
    Ok(())
}

#[test]
fn second_persist_is_a_noop() -> Result<()> {
    let perdag = durable()?;
    let (client, memdag) = open_client(&perdag)?;
    put(&memdag, &client, "a", json!(1))?;
    persist_now(&client, &memdag, &perdag)?;
    let before = branch_of(&perdag, &client)?;
    persist_now(&client, &memdag, &perdag)?;
    assert_eq!(branch_of(&perdag, &client)?, before);
    Ok(())
}

#[test]
fn older_working_snapshot_leaves_durable_head() -> Result<()> {
    let perdag = durable()?;
    let (client, memdag) = open_client(&perdag)?;
    let durable_head = durable_snapshot(&perdag, &client, json!("2"))?;
    working_snapshot(&memdag, MutationIds::new(), json!("1"), &[])?;

    persist_now(&client, &memdag, &perdag)?;

    assert_eq!(branch_of(&perdag, &client)?.head_hash, durable_head);
    Ok(())
}

#[test]
fn newer_working_snapshot_is_written_with_branch_mutations_replayed() -> Result<()> {
    let perdag = durable()?;
    let (a, memdag_a) = open_client(&perdag)?;
    let (b, memdag_b) = open_client(&perdag)?;
    put(&memdag_b, &b, "from-b", json!(true))?;
    persist_now(&b, &memdag_b, &perdag)?;

    let snapshot = working_snapshot(&memdag_a, MutationIds::new(), json!(1), &[("s", json!("server"))])?;
    assert!(memdag_a.is_mem_only(&snapshot));
    persist_now(&a, &memdag_a, &perdag)?;

    let branch = branch_of(&perdag, &a)?;
    assert!(branch.last_server_ackd_mutation_ids.is_empty());
    assert_eq!(branch.mutation_ids.get(&b), Some(&1));
    assert_eq!(value_at(&*perdag, branch.head_hash, "s")?, Some(json!("server")));
    assert_eq!(value_at(&*perdag, branch.head_hash, "from-b")?, Some(json!(true)));
    with_read(&*perdag, |r| {
        let head = commit_from_hash(&branch.head_hash, r)?;
        assert_eq!(head.basis_hash(), Some(snapshot));
        Ok(())
    })?;
    assert!(!memdag_a.is_mem_only(&snapshot));
    Ok(())
}

#[test]
fn refresh_brings_in_other_clients_mutations() -> Result<()> {
    let perdag = durable()?;
    let (a, memdag_a) = open_client(&perdag)?;
    let (b, memdag_b) = open_client(&perdag)?;
    put(&memdag_a, &a, "a", json!(1))?;
    put(&memdag_b, &b, "b", json!(2))?;
    persist_now(&b, &memdag_b, &perdag)?;

    let (head, diffs) = refresh(&a, &memdag_a, &*perdag, &mutators(), refresh_opts(), &Shutdown::new())?
        .ok_or(PenumbraError::Invalid("refresh should apply"))?;

    let changed: Vec<_> = diffs.main().iter().map(|op| op.key().to_string()).collect();
    assert_eq!(changed, vec!["b".to_string()]);
    with_read(&memdag_a, |r| {
        assert_eq!(r.must_get_head(DEFAULT_HEAD_NAME)?, head);
        let commit = commit_from_head(DEFAULT_HEAD_NAME, r)?;
        assert_eq!(commit.mutation_id(&a, r)?, 1);
        assert_eq!(commit.mutation_id(&b, r)?, 1);
        let read = Read::new(r, commit);
        assert_eq!(read.get("a")?, Some(json!(1)));
        assert_eq!(read.get("b")?, Some(json!(2)));
        Ok(())
    })?;
    let stored = with_read(&*perdag, |r| must_get_client(&a, r))?;
    assert_eq!(stored.temp_refresh_hash, None);

    // A's own mutation still reaches the branch afterwards.
    persist_now(&a, &memdag_a, &perdag)?;
    let branch = branch_of(&perdag, &a)?;
    assert_eq!(branch.mutation_ids.get(&a), Some(&1));
    assert_eq!(value_at(&*perdag, branch.head_hash, "a")?, Some(json!(1)));
    Ok(())
}

#[test]
fn refresh_is_a_noop_when_branch_has_nothing_new() -> Result<()> {
    let perdag = durable()?;
    let (a, memdag_a) = open_client(&perdag)?;
    let res = refresh(&a, &memdag_a, &*perdag, &mutators(), refresh_opts(), &Shutdown::new())?;
    assert!(res.is_none());
    Ok(())
}

#[test]
fn refresh_keeps_newer_working_snapshot() -> Result<()> {
    let perdag = durable()?;
    let (a, memdag_a) = open_client(&perdag)?;
    let (b, memdag_b) = open_client(&perdag)?;
    put(&memdag_b, &b, "b", json!(2))?;
    persist_now(&b, &memdag_b, &perdag)?;
    let snapshot = working_snapshot(&memdag_a, MutationIds::new(), json!(5), &[])?;

    let res = refresh(&a, &memdag_a, &*perdag, &mutators(), refresh_opts(), &Shutdown::new())?;
    assert!(res.is_none());
    assert_eq!(with_read(&memdag_a, |r| r.must_get_head(DEFAULT_HEAD_NAME))?, snapshot);
    Ok(())
}

#[test]
fn interrupted_refresh_releases_its_pin() -> Result<()> {
    let perdag = durable()?;
    let (a, memdag_a) = open_client(&perdag)?;
    let (b, memdag_b) = open_client(&perdag)?;
    put(&memdag_b, &b, "b", json!(2))?;
    persist_now(&b, &memdag_b, &perdag)?;
    let before = with_read(&*perdag, |r| must_get_client(&a, r))?;
    let working_head = with_read(&memdag_a, |r| r.must_get_head(DEFAULT_HEAD_NAME))?;

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        trigger.trigger();
    });
    let slow = RefreshOptions {
        btree: opts(),
        settle: Duration::from_secs(30),
    };
    let res = refresh(&a, &memdag_a, &*perdag, &mutators(), slow, &shutdown);
    waker
        .join()
        .map_err(|_| PenumbraError::Invalid("shutdown thread panicked"))?;

    assert!(matches!(res, Err(PenumbraError::Closed)));
    let stored = with_read(&*perdag, |r| must_get_client(&a, r))?;
    assert_eq!(stored.temp_refresh_hash, None);
    assert_eq!(stored.head_hash, before.head_hash);
    assert_eq!(with_read(&memdag_a, |r| r.must_get_head(DEFAULT_HEAD_NAME))?, working_head);
    Ok(())
}

#[test]
fn persist_of_collected_client_fails() -> Result<()> {
    let perdag = durable()?;
    let (_, memdag) = open_client(&perdag)?;
    let err = persist_now(&ClientId::from("ghost"), &memdag, &perdag);
    assert!(matches!(err, Err(ref e) if e.is_client_state_not_found()));
    Ok(())
}

#[test]
fn closed_persist_writes_nothing() -> Result<()> {
    let perdag = durable()?;
    let (client, memdag) = open_client(&perdag)?;
    put(&memdag, &client, "a", json!(1))?;
    let before = branch_of(&perdag, &client)?;
    let shutdown = Shutdown::new();
    shutdown.trigger();
    let err = persist(&client, &memdag, &*perdag, &mutators(), opts(), &shutdown);
    assert!(matches!(err, Err(PenumbraError::Closed)));
    assert_eq!(branch_of(&perdag, &client)?, before);
    Ok(())
}
