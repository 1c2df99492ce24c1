use super::{BranchId, ClientId, Hash};

/// Errors produced by the storage, commit and sync layers.
#[derive(thiserror::Error, Debug)]
pub enum PenumbraError {
    /// Underlying IO failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Failure reported by the SQLite byte store.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A chunk payload or registry record could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    /// Stored bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an invalid argument, with details.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A referenced chunk is not present in the store.
    #[error("missing chunk {0}")]
    MissingChunk(Hash),
    /// A named head the operation depends on does not exist.
    #[error("missing head {0}")]
    MissingHead(String),
    /// The client's registry entry was garbage collected while in use.
    #[error("client state not found: {id}")]
    ClientStateNotFound {
        /// Client whose entry is gone.
        id: ClientId,
    },
    /// The branch's registry entry was garbage collected while in use.
    #[error("branch state not found: {id}")]
    BranchStateNotFound {
        /// Branch whose entry is gone.
        id: BranchId,
    },
    /// A replayed mutation does not carry the next mutation id of its basis.
    #[error("inconsistent mutation id: expected {expected}, got {actual}")]
    InconsistentMutation {
        /// Next mutation id computed from the new basis.
        expected: u64,
        /// Mutation id recorded on the commit being replayed.
        actual: u64,
    },
    /// Another sync landed on the main head while this one was running.
    #[error("overlapping syncs")]
    OverlappingSyncs,
    /// The pull collaborator failed at the transport level.
    #[error("pull failed: {0}")]
    Pull(String),
    /// The push collaborator failed at the transport level.
    #[error("push failed: {0}")]
    Push(String),
    /// The store or replica was closed.
    #[error("closed")]
    Closed,
    /// A background cycle observed the shutdown signal before committing.
    #[error("cancelled")]
    Cancelled,
}

impl PenumbraError {
    /// True for the registry-not-found errors the application must react to
    /// by resetting its local state.
    pub fn is_state_not_found(&self) -> bool {
        matches!(
            self,
            PenumbraError::ClientStateNotFound { .. } | PenumbraError::BranchStateNotFound { .. }
        )
    }

    /// True when this client's own registry entry is gone.
    pub fn is_client_state_not_found(&self) -> bool {
        matches!(self, PenumbraError::ClientStateNotFound { .. })
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, PenumbraError>;
