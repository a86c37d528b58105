use crate::types::{NodeId, RequestRecord, Timestamp};
use std::cmp::Ordering;

/// A claim on the critical section, ordered by priority.
///
/// Earlier timestamps come first; equal timestamps fall back to the lower
/// node id. No two distinct nodes ever compare equal, so the order is total
/// across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub timestamp: Timestamp,
    pub node: NodeId,
}

impl Claim {
    pub fn new(node: NodeId, timestamp: Timestamp) -> Self {
        Self { timestamp, node }
    }

    /// Strictly higher priority than `other`.
    pub fn outranks(&self, other: &Claim) -> bool {
        self < other
    }
}

impl From<RequestRecord> for Claim {
    fn from(record: RequestRecord) -> Self {
        Self::new(record.requester, record.timestamp)
    }
}

impl PartialOrd for Claim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Claim {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.node.cmp(&other.node))
    }
}
