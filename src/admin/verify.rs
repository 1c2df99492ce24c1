use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_store;
use crate::admin::Result;
use crate::persist::{get_branches, get_clients, BRANCHES_HEAD_NAME, CLIENTS_HEAD_NAME};
use crate::storage::dag::{with_read, DagRead, Store};
use crate::storage::db::{chain, Read, ScanOptions, DEFAULT_HEAD_NAME};
use crate::types::Hash;

/// Findings kept in a report; the rest are only counted.
const MAX_FINDINGS: usize = 32;

/// How much of the store a verification pass reads.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// The client and branch registries and the heads they name.
    Fast,
    /// Additionally every chunk reachable from the registry and main heads,
    /// every branch chain and every branch's main map.
    Full,
}

/// Ordered from least to most serious.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Worth knowing, nothing to repair.
    Info,
    /// Inconsistent but recoverable, e.g. a branch awaiting collection.
    Warning,
    /// Data a replica needs is gone or unreadable.
    Error,
}

/// What a finding is about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum VerifySubject {
    /// A client registry entry.
    Client(String),
    /// A branch registry entry.
    Branch(String),
    /// A chunk some reachable chunk refers to.
    Chunk(Hash),
}

impl fmt::Display for VerifySubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifySubject::Client(id) => write!(f, "client {id}"),
            VerifySubject::Branch(id) => write!(f, "branch {id}"),
            VerifySubject::Chunk(hash) => write!(f, "chunk {hash}"),
        }
    }
}

/// One problem found in a store.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// How serious the problem is.
    pub severity: VerifySeverity,
    /// The registry entry or chunk concerned.
    pub subject: VerifySubject,
    /// The problem, without the subject.
    pub message: String,
}

impl fmt::Display for VerifyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

/// Sizes of what the pass looked at. Chunk, commit and entry counts stay
/// zero at [`VerifyLevel::Fast`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Client registry entries.
    pub clients: u64,
    /// Branch registry entries.
    pub branches: u64,
    /// Distinct chunks reachable from the registry and main heads.
    pub chunks_reachable: u64,
    /// Payload bytes of those chunks.
    pub chunk_bytes: u64,
    /// Commits on branch chains, counted once per branch.
    pub commits: u64,
    /// Main map entries summed over branch heads.
    pub entries: u64,
}

/// Result of [`verify`].
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// Store name within the data directory.
    pub database: String,
    /// Level the pass ran at.
    pub level: VerifyLevel,
    /// No finding is an [`VerifySeverity::Error`].
    pub success: bool,
    /// Number of error findings, including omitted ones.
    pub errors: usize,
    /// Most serious first, at most 32.
    pub findings: Vec<VerifyFinding>,
    /// Findings beyond the kept ones.
    pub omitted: usize,
    /// What the pass looked at.
    pub counts: VerifyCounts,
}

#[derive(Default)]
struct Findings {
    items: Vec<VerifyFinding>,
    errors: usize,
    omitted: usize,
}

impl Findings {
    fn error(&mut self, subject: VerifySubject, message: impl Into<String>) {
        self.errors += 1;
        self.push(VerifySeverity::Error, subject, message.into());
    }

    fn warning(&mut self, subject: VerifySubject, message: impl Into<String>) {
        self.push(VerifySeverity::Warning, subject, message.into());
    }

    fn push(&mut self, severity: VerifySeverity, subject: VerifySubject, message: String) {
        if self.items.len() == MAX_FINDINGS {
            self.omitted += 1;
            return;
        }
        self.items.push(VerifyFinding {
            severity,
            subject,
            message,
        });
    }
}

/// Checks store `name` for registry entries pointing nowhere and, at
/// [`VerifyLevel::Full`], for dangling chunk references and unreadable
/// branch maps. The store is opened read-only and closed again.
pub fn verify(data_dir: &Path, name: &str, opts: &AdminOpenOptions, level: VerifyLevel) -> Result<VerifyReport> {
    let handle = open_store(data_dir, name, opts)?;
    let outcome = with_read(&*handle.store, |r| {
        let mut findings = Findings::default();
        let mut counts = VerifyCounts::default();
        check_registries(r, &mut findings, &mut counts)?;
        if matches!(level, VerifyLevel::Full) {
            walk_chunks(r, &mut findings, &mut counts)?;
            check_branch_maps(r, &mut findings, &mut counts)?;
        }
        Ok((findings, counts))
    });
    handle.store.close()?;
    let (mut findings, counts) = outcome?;
    findings.items.sort_by(|a, b| b.severity.cmp(&a.severity));
    debug!(
        database = name,
        errors = findings.errors,
        findings = findings.items.len() + findings.omitted,
        "admin.verify.finished"
    );
    Ok(VerifyReport {
        database: name.to_string(),
        level,
        success: findings.errors == 0,
        errors: findings.errors,
        findings: findings.items,
        omitted: findings.omitted,
        counts,
    })
}

fn check_registries(r: &dyn DagRead, findings: &mut Findings, counts: &mut VerifyCounts) -> crate::Result<()> {
    let clients = get_clients(r)?;
    let branches = get_branches(r)?;
    counts.clients = clients.len() as u64;
    counts.branches = branches.len() as u64;

    for (id, client) in &clients {
        if !branches.contains_key(&client.branch_id) {
            findings.error(
                VerifySubject::Client(id.to_string()),
                format!("belongs to missing branch {}", client.branch_id),
            );
        }
        if !r.has_chunk(&client.head_hash)? {
            findings.error(
                VerifySubject::Client(id.to_string()),
                format!("head {} is missing", client.head_hash),
            );
        }
    }
    for (id, branch) in &branches {
        if !r.has_chunk(&branch.head_hash)? {
            findings.error(
                VerifySubject::Branch(id.to_string()),
                format!("head {} is missing", branch.head_hash),
            );
        }
        for (client, ackd) in &branch.last_server_ackd_mutation_ids {
            let latest = branch.mutation_ids.get(client).copied().unwrap_or(0);
            if *ackd > latest {
                findings.warning(
                    VerifySubject::Branch(id.to_string()),
                    format!("client {client} acknowledged at {ackd} beyond its last mutation {latest}"),
                );
            }
        }
        let referenced = clients.values().any(|c| &c.branch_id == id);
        if !referenced && !branch.has_pending_mutations() {
            findings.warning(
                VerifySubject::Branch(id.to_string()),
                "has no clients and is waiting for collection",
            );
        }
    }
    Ok(())
}

fn walk_chunks(r: &dyn DagRead, findings: &mut Findings, counts: &mut VerifyCounts) -> crate::Result<()> {
    let mut stack: Vec<Hash> = Vec::new();
    for head in [CLIENTS_HEAD_NAME, BRANCHES_HEAD_NAME, DEFAULT_HEAD_NAME] {
        if let Some(hash) = r.get_head(head)? {
            stack.push(hash);
        }
    }
    let mut seen = HashSet::new();
    while let Some(hash) = stack.pop() {
        if hash.is_empty() || !seen.insert(hash) {
            continue;
        }
        match r.get_chunk(&hash)? {
            Some(chunk) => {
                counts.chunks_reachable += 1;
                counts.chunk_bytes += chunk.size() as u64;
                stack.extend(chunk.refs().iter().copied());
            }
            None => findings.error(VerifySubject::Chunk(hash), "is referenced but missing"),
        }
    }
    Ok(())
}

fn check_branch_maps(r: &dyn DagRead, findings: &mut Findings, counts: &mut VerifyCounts) -> crate::Result<()> {
    for (id, branch) in get_branches(r)? {
        let commits = match chain(&branch.head_hash, r) {
            Ok(commits) => commits,
            Err(err) => {
                findings.error(VerifySubject::Branch(id.to_string()), format!("chain is unreadable: {err}"));
                continue;
            }
        };
        counts.commits += commits.len() as u64;
        if let Some(head) = commits.into_iter().next() {
            match Read::new(r, head).scan(&ScanOptions::default()) {
                Ok(items) => counts.entries += items.len() as u64,
                Err(err) => findings.error(VerifySubject::Branch(id.to_string()), format!("map is unreadable: {err}")),
            }
        }
    }
    Ok(())
}
