//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// The cluster has no elected leader to service the request.
    ///
    /// The hint carries the last leader this node has heard from, if any; clients should retarget
    /// and retry with backoff.
    #[error("the cluster has no elected leader")]
    NoLeader { leader_hint: Option<NodeId> },
    /// The node is in a state which prohibits servicing the request.
    #[error("the member state prohibits servicing the request")]
    IllegalMemberState,
    /// Replication of the entry failed to reach a quorum within this leader's term.
    #[error("the command could not be committed to the cluster")]
    CommandError,
    /// The user state machine returned an error while applying an operation.
    ///
    /// Application errors are surfaced to the submitter only; they never destabilize Raft itself.
    #[error("the state machine failed to apply the operation: {0}")]
    Application(String),
    /// The session is unknown to the cluster, typically because it was expired.
    #[error("unknown session {0}")]
    UnknownSession(u64),
    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// An error which has taken place during snapshot streaming.
    #[error("snapshot segment id mismatch, expect: {expect}, got: {got}")]
    SnapshotMismatch {
        expect: SnapshotSegmentId,
        got: SnapshotSegmentId,
    },
    /// The Raft node is shutting down.
    #[error("the Raft node is shutting down")]
    ShuttingDown,
}

impl From<std::io::Error> for RaftError {
    fn from(src: std::io::Error) -> Self {
        RaftError::RaftStorage(src.into())
    }
}

/// The wire form of a `RaftError`, carried in the `status` of error responses.
///
/// Raw storage & I/O failures are never propagated to clients; handlers translate them into one
/// of these kinds before responding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoLeader,
    IllegalMemberState,
    CommandError,
    ApplicationError,
    InternalError,
    UnknownSession,
}

impl RaftError {
    /// The wire kind of this error, as carried in error responses.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from(self)
    }
}

impl From<&RaftError> for ErrorKind {
    fn from(src: &RaftError) -> Self {
        match src {
            RaftError::NoLeader { .. } => ErrorKind::NoLeader,
            RaftError::IllegalMemberState => ErrorKind::IllegalMemberState,
            RaftError::CommandError => ErrorKind::CommandError,
            RaftError::Application(_) => ErrorKind::ApplicationError,
            RaftError::UnknownSession(_) => ErrorKind::UnknownSession,
            _ => ErrorKind::InternalError,
        }
    }
}

/// An error related to a config change request.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChangeConfigError {
    /// An error related to the processing of the config change request.
    ///
    /// Errors of this type will only come about from the internals of applying the config change
    /// to the Raft log and the process related to that workflow.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The cluster is already undergoing a configuration change.
    ///
    /// Only one uncommitted configuration change may exist at a time; callers should wait for the
    /// in-flight change to commit before submitting the next one.
    #[error("a configuration change is already in progress")]
    ConfigChangeInProgress,
    /// The given config would leave the cluster in an inoperable state.
    ///
    /// This error will be returned if the full set of changes, once fully applied, would leave
    /// the cluster with less than two members.
    #[error("the given config would leave the cluster in an inoperable state")]
    InoperableConfig,
    /// The node the config change relates to is not in a state that allows the change.
    #[error("the target member is not in a state that allows the requested change")]
    MemberStateMismatch,
    /// The proposed config change was a no-op.
    #[error("the proposed config change was a no-op")]
    Noop,
    /// The request was not forwarded to a leader, and this node is not it.
    #[error("this node is not the Raft leader")]
    NodeNotLeader(Option<NodeId>),
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the node's current state")]
    NotAllowed,
}

/// Error variants related to configuration validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The heartbeat interval must be at most half of the election timeout.
    #[error("heartbeat interval must be at most half of the election timeout")]
    InvalidHeartbeatInterval,
    /// The session timeout must be no shorter than the heartbeat interval.
    #[error("session timeout must be no shorter than the heartbeat interval")]
    InvalidSessionTimeout,
    /// Segment bounds must admit at least one maximum-size entry.
    #[error("max segment size must exceed max entry size and hold at least one entry")]
    InvalidSegmentSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_on_the_wire() {
        assert_eq!(RaftError::NoLeader { leader_hint: None }.kind(), ErrorKind::NoLeader);
        assert_eq!(RaftError::IllegalMemberState.kind(), ErrorKind::IllegalMemberState);
        assert_eq!(RaftError::CommandError.kind(), ErrorKind::CommandError);
        assert_eq!(RaftError::Application("boom".into()).kind(), ErrorKind::ApplicationError);
        assert_eq!(RaftError::UnknownSession(7).kind(), ErrorKind::UnknownSession);
        assert_eq!(RaftError::Internal("invariant".into()).kind(), ErrorKind::InternalError);
        assert_eq!(RaftError::ShuttingDown.kind(), ErrorKind::InternalError);
    }
}
