//! Commit graph over the chunk store.
//!
//! A commit records one version of the application state: the root of the
//! main map, the roots of its secondary indexes and a [`Meta`] saying how
//! it came to be. Snapshots start a chain, local commits record replayable
//! mutations on top of it and index changes alter the index set. [`Write`]
//! builds new commits, [`Read`] views existing ones and the rebase helpers
//! replay local commits onto a different basis.
#![forbid(unsafe_code)]

mod commit;
mod diff;
mod index;
mod read;
mod rebase;
mod scan;
mod transaction;
mod write;

pub use commit::{
    base_snapshot, base_snapshot_from_hash, chain, commit_from_hash, commit_from_head,
    compare_cookies, local_mutations, local_mutations_greater_than, read_commit, Commit,
    CommitData, IndexChangeMeta, IndexDefinition, IndexDefinitions, IndexRecord, LocalMeta, Meta,
    SnapshotMeta, Whence, DEFAULT_HEAD_NAME, REFRESH_HEAD_NAME, SYNC_HEAD_NAME,
};
pub use diff::{diff_commits, DiffsMap, MAIN_MAP};
pub use index::{decode_index_key, encode_index_key, encode_index_scan_key};
pub use read::Read;
pub use rebase::{rebase_mutation_and_commit, rebase_mutation_and_put_commit, Mutator, Mutators};
pub use scan::{ScanItem, ScanOptions};
pub use transaction::WriteTransaction;
pub use write::{MutationInfo, Write};

#[cfg(test)]
mod tests;
