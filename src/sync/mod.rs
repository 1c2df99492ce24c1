//! Exchange with the application's server.
//!
//! A pull stages the server's answer as a sync branch on top of the main
//! head's base snapshot, replays whatever local mutations the server has not
//! seen yet and then swaps the branch in. A push sends the pending local
//! mutations. Recovery does the same for branches whose clients went away
//! before the server acknowledged them. Transports are supplied by the
//! application through [`Puller`] and [`Pusher`].
#![forbid(unsafe_code)]

mod auth;
mod patch;
mod protocol;
mod pull;
mod push;
mod recovery;

pub use auth::{Auth, AuthProvider, MAX_REAUTH_TRIES};
pub use patch::apply_patch;
pub use protocol::{
    HttpRequestInfo, PatchOperation, PullRequest, PullResponse, PullResponseOk, Puller,
    PullerResult, PushMutation, PushRequest, PushResponse, Pusher, PusherResult, PULL_VERSION,
    PUSH_VERSION,
};
pub use pull::{
    begin_pull, handle_pull_response, maybe_end_pull, pull, BeginPullResponse, HandlePullResponse,
    MaybeEndPull, PullContext, PullOutcome,
};
pub use push::{pending_mutations, push, PushContext};
pub use recovery::{
    recover_mutations, recover_mutations_in_databases, BranchRecovery, RecoveryContext,
    RECOVERY_CACHE_BYTES,
};
