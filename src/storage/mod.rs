//! Storage layers of the sync engine.
//!
//! [`dag`] is the content-addressed chunk store, [`btree`] the persistent
//! ordered map built from its chunks and [`db`] the commit graph that ties
//! map versions together.

/// Persistent B-tree over chunks.
pub mod btree;

/// Content-addressed chunk store with named heads.
pub mod dag;

/// Commits, reads, writes and rebase.
pub mod db;
