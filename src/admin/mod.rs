#![forbid(unsafe_code)]

//! Data directory administration and maintenance utilities.
//!
//! This module provides the offline operations behind the `penumbra` binary:
//! listing a store's heads and registries, listing the stores registered in a
//! data directory, collecting idle clients and branches, and verifying that
//! every reference resolves.

mod error;
mod gc;
mod inspect;
mod options;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Runs the client and branch collectors on a store that is not open elsewhere.
pub use gc::{gc, GcReport};

/// Read-only listings of heads, clients, branches and registered stores.
pub use inspect::{
    branches, clients, databases, heads, BranchEntry, BranchesReport, ClientEntry, ClientsReport,
    DatabasesReport, HeadEntry, HeadsReport,
};

/// Configuration options for opening a data directory in admin mode.
pub use options::{AdminGcOptions, AdminOpenOptions};

/// Helpers for opening a store by name inside a data directory.
pub use util::{open_provider, open_registry, open_store, StoreHandle};

/// Reference integrity checks over a store.
pub use verify::{
    verify, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport, VerifySeverity, VerifySubject,
};
