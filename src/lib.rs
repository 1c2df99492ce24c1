//! Local-first replication engine.
//!
//! Application state lives in a content-addressed commit graph kept in a
//! memory-resident working store layered over a durable store shared by
//! every client of an installation. Clients mutate locally, promote their
//! work into a shared branch, pick up each other's progress and sync with a
//! server through application-supplied pull and push transports.
//!
//! Start with [`replica::Replica`]; the layers below it are public for
//! tooling such as the `penumbra` admin binary.

#![warn(missing_docs)]

pub mod admin;
pub mod persist;
pub mod primitives;
pub mod replica;
pub mod storage;
pub mod sync;
pub mod types;

pub use replica::{Replica, ReplicaOptions};
pub use types::{PenumbraError, Result};
