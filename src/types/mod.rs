//! Identity types, errors and small helpers shared by every layer.
#![forbid(unsafe_code)]

pub mod checksum;
pub mod error;
pub mod hash;
pub mod ids;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{PenumbraError, Result};
pub use hash::{ChunkHasher, Hash};
pub use ids::{BranchId, ClientId, MutationIds};

/// Milliseconds since the unix epoch, saturating to zero for clocks set before it.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
