use crate::types::{NodeId, Phase};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::coordinator::Coordinator`].
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a request cycle is already in progress ({phase:?})")]
    AlreadyActive { phase: Phase },

    #[error("no quorum after {waited:?}: {grants} of {needed} grants received")]
    QuorumTimeout {
        waited: Duration,
        grants: usize,
        needed: usize,
    },

    #[error("critical section failed: {0}")]
    CriticalSection(#[from] ExecutorError),
}

/// Inbound payloads that are not a well-formed REQ or GRANT.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,

    #[error("unknown message kind '{0}'")]
    UnknownKind(String),

    #[error("{kind} expects {expected} fields, got {got}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid node id '{0}'")]
    InvalidNodeId(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("message is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("topology is empty")]
    Empty,

    #[error("invalid node id '{0}': expected a positive integer")]
    InvalidNodeId(String),

    #[error("node {0} is listed more than once")]
    DuplicateNode(NodeId),

    #[error("invalid peer address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("invalid peer entry '{0}': expected <id>=<host>:<port>")]
    InvalidEntry(String),

    #[error("node {0} is not part of the topology")]
    UnknownNode(NodeId),

    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse topology file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("access log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("access log task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
