//! Requests and responses exchanged with the application's server.
//!
//! The transport is the application's business: it implements [`Puller`]
//! and [`Pusher`] and reports transport-level outcome through
//! [`HttpRequestInfo`], separate from the sync-level response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{BranchId, ClientId, MutationIds, Result};

/// Pull protocol version sent with every pull.
pub const PULL_VERSION: u32 = 1;

/// Push protocol version sent with every push.
pub const PUSH_VERSION: u32 = 1;

/// Transport-level outcome of a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestInfo {
    /// Status code, `200` on success.
    pub http_status_code: u16,
    /// Error text, empty on success.
    #[serde(default)]
    pub error_message: String,
}

impl HttpRequestInfo {
    /// A successful exchange.
    pub fn ok() -> Self {
        Self {
            http_status_code: 200,
            error_message: String::new(),
        }
    }

    /// A failed exchange.
    pub fn failed(http_status_code: u16, error_message: impl Into<String>) -> Self {
        Self {
            http_status_code,
            error_message: error_message.into(),
        }
    }

    /// Whether the status code is 200.
    pub fn is_ok(&self) -> bool {
        self.http_status_code == 200
    }

    /// Whether the server rejected the auth token.
    pub fn is_unauthorized(&self) -> bool {
        self.http_status_code == 401
    }
}

/// One change to apply to a snapshot's map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOperation {
    /// Set `key` to `value`.
    Put {
        /// Key to set.
        key: String,
        /// New value.
        value: Value,
    },
    /// Remove `key`.
    Del {
        /// Key to remove.
        key: String,
    },
    /// Remove every key.
    Clear,
}

/// Body of a pull request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Installation the request comes from.
    pub profile_id: String,
    /// Branch being synced.
    pub branch_id: BranchId,
    /// Position the branch's base snapshot is at.
    pub cookie: Value,
    /// Whether the server has never acknowledged anything on this branch.
    pub is_new_branch: bool,
    /// See [`PULL_VERSION`].
    pub pull_version: u32,
    /// Application schema version.
    pub schema_version: String,
}

/// Successful pull payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponseOk {
    /// New sync position.
    pub cookie: Value,
    /// Last mutation id the server applied, for clients whose value moved.
    #[serde(default)]
    pub last_mutation_id_changes: MutationIds,
    /// Changes to bring the base snapshot up to `cookie`.
    #[serde(default)]
    pub patch: Vec<PatchOperation>,
}

/// Sync-level pull response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PullResponse {
    /// New state to apply.
    Ok(PullResponseOk),
    /// The server does not know the branch's clients.
    ClientStateNotFound,
    /// The server does not speak this pull or schema version.
    VersionNotSupported {
        /// Which version the server rejected, if it said.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_type: Option<String>,
    },
}

impl PullResponse {
    /// Whether this is one of the error responses.
    pub fn is_error(&self) -> bool {
        !matches!(self, PullResponse::Ok(_))
    }
}

/// What a [`Puller`] hands back.
#[derive(Clone, Debug, PartialEq)]
pub struct PullerResult {
    /// Absent when the transport failed.
    pub response: Option<PullResponse>,
    /// Transport-level outcome.
    pub http_request_info: HttpRequestInfo,
}

/// Sends pull requests to the server.
pub trait Puller: Send + Sync {
    /// Performs one pull. Transport failures the implementation cannot
    /// express through [`HttpRequestInfo`] surface as `PenumbraError::Pull`.
    fn pull(&self, request: &PullRequest, auth: &str, request_id: &str) -> Result<PullerResult>;
}

/// One mutation in a push request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMutation {
    /// Client that ran the mutation.
    pub client_id: ClientId,
    /// Its per-client mutation id.
    pub id: u64,
    /// Mutator name.
    pub name: String,
    /// Mutator arguments.
    pub args: Value,
    /// Time of the original invocation.
    pub timestamp: u64,
}

/// Body of a push request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Installation the request comes from.
    pub profile_id: String,
    /// Branch the mutations belong to.
    pub branch_id: BranchId,
    /// Pending mutations, oldest first.
    pub mutations: Vec<PushMutation>,
    /// See [`PUSH_VERSION`].
    pub push_version: u32,
    /// Application schema version.
    pub schema_version: String,
}

/// Sync-level push error responses. A successful push has none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushResponse {
    /// The server does not know the branch's clients.
    ClientStateNotFound,
    /// The server does not speak this push or schema version.
    VersionNotSupported {
        /// Which version the server rejected, if it said.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_type: Option<String>,
    },
}

/// What a [`Pusher`] hands back.
#[derive(Clone, Debug, PartialEq)]
pub struct PusherResult {
    /// Error response, if the server sent one.
    pub response: Option<PushResponse>,
    /// Transport-level outcome.
    pub http_request_info: HttpRequestInfo,
}

/// Sends push requests to the server.
pub trait Pusher: Send + Sync {
    /// Performs one push. Acknowledgement of the mutations arrives later,
    /// through a pull.
    fn push(&self, request: &PushRequest, auth: &str, request_id: &str) -> Result<PusherResult>;
}
