use serde::{Deserialize, Serialize};

use super::{NodeId, Timestamp};

/// A peer's claim on the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Node asking for access
    pub requester: NodeId,
    /// When the requester issued its claim
    pub timestamp: Timestamp,
}

impl RequestRecord {
    pub fn new(requester: NodeId, timestamp: Timestamp) -> Self {
        Self {
            requester,
            timestamp,
        }
    }
}

/// Where a node is in its own request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No outstanding request, not holding the resource
    Idle,
    /// Broadcast sent, collecting grants
    Requesting,
    /// Quorum reached, resource held
    InCriticalSection,
}

/// A decoded protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// `REQ:<requester>:<timestamp>`
    Request(RequestRecord),
    /// `GRANT:<granter>`
    Grant { granter: NodeId },
}

/// A message the state machine wants delivered to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

impl Outbound {
    pub fn grant(to: NodeId, granter: NodeId) -> Self {
        Self {
            to,
            message: Message::Grant { granter },
        }
    }
}

/// Result of handing a message to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peer accepted the connection and the payload was written
    Delivered,
    /// The peer was unreachable or the write failed
    Failed { reason: String },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}
