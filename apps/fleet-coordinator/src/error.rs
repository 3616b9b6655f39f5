use fleet_wire::{CommandKind, WireError};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::registry::ConnectionState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("link disconnected")]
    Disconnected,
    #[error("write did not complete in time")]
    Timeout,
    #[error("no link bound for node {0}")]
    UnknownNode(String),
    #[error("frame error: {0}")]
    Frame(#[from] WireError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),
    #[error("unexpected {message} from {node_id}")]
    Unexpected {
        node_id: String,
        message: &'static str,
    },
    #[error("envelope claims node {claimed} on a link bound to {bound}")]
    NodeMismatch { bound: String, claimed: String },
    #[error("expected handshake, received {0}")]
    ExpectedHandshake(&'static str),
    #[error("no handshake before the deadline")]
    HandshakeTimeout,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("node id must not be empty")]
    EmptyNodeId,
}

impl ProtocolError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::Unexpected { .. } => "unexpected",
            ProtocolError::NodeMismatch { .. } => "node_mismatch",
            ProtocolError::ExpectedHandshake(_) => "expected_handshake",
            ProtocolError::HandshakeTimeout => "handshake_timeout",
            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
            ProtocolError::EmptyNodeId => "empty_node_id",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{kind} to {node_id} unacknowledged after {attempts} attempts")]
    TimedOut {
        node_id: String,
        kind: CommandKind,
        attempts: u32,
    },
    #[error("{kind} to {node_id} superseded by command {by}")]
    Superseded {
        node_id: String,
        kind: CommandKind,
        by: u64,
    },
    #[error("{kind} rejected by {node_id}: {reason}")]
    Rejected {
        node_id: String,
        kind: CommandKind,
        reason: String,
    },
    #[error("{kind} to {node_id} cancelled")]
    Cancelled { node_id: String, kind: CommandKind },
    #[error("{node_id} unreachable: {source}")]
    Unreachable {
        node_id: String,
        #[source]
        source: TransportError,
    },
    #[error("command dispatcher stopped")]
    DispatcherClosed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no fresh clock estimate for {node_id}")]
pub struct ClockUnavailableError {
    pub node_id: String,
}

/// Why a node could not take part in (or dropped out of) a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    NotConnected,
    NotReady { state: ConnectionState },
    ClockUnavailable,
    Timeout,
    Rejected { detail: String },
    Lost { state: ConnectionState },
    Cancelled,
}

impl From<&CommandError> for FailureReason {
    fn from(err: &CommandError) -> Self {
        match err {
            CommandError::TimedOut { .. } => FailureReason::Timeout,
            CommandError::Rejected { reason, .. } => FailureReason::Rejected {
                detail: reason.clone(),
            },
            CommandError::Unreachable { .. } => FailureReason::Lost {
                state: ConnectionState::Disconnected,
            },
            CommandError::Superseded { .. }
            | CommandError::Cancelled { .. }
            | CommandError::DispatcherClosed => FailureReason::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeFailure {
    pub node_id: String,
    #[serde(flatten)]
    pub reason: FailureReason,
}

impl NodeFailure {
    pub fn new(node_id: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            node_id: node_id.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ArmError {
    #[error("no nodes requested")]
    EmptyRequest,
    #[error("session {session_id} is still active")]
    SessionActive { session_id: Uuid },
    #[error("quorum not met: {eligible} of {requested} nodes ready, {required} required")]
    QuorumNotMet {
        requested: usize,
        eligible: usize,
        required: usize,
        rejected: Vec<NodeFailure>,
    },
    #[error("none of the requested nodes are ready")]
    NoEligibleNodes { rejected: Vec<NodeFailure> },
    #[error("session {session_id} aborted while arming")]
    Aborted {
        session_id: Uuid,
        failures: Vec<NodeFailure>,
    },
    #[error("coordinator stopped")]
    CoordinatorClosed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum StopError {
    #[error("no session is active")]
    NoActiveSession,
    #[error("coordinator stopped")]
    CoordinatorClosed,
}
