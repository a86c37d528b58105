use crate::priority::Claim;
use crate::types::{NodeId, RequestRecord, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictStatus {
    /// Answer the requester right away
    Grant,
    /// Queue the requester until release
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// This node holds the resource
    InCriticalSection,
    /// This node's pending claim precedes the requester's
    OwnClaimFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerVerdict {
    pub status: VerdictStatus,
    pub reason: Option<DeferReason>,
}

impl SchedulerVerdict {
    const GRANT: Self = Self {
        status: VerdictStatus::Grant,
        reason: None,
    };

    fn defer(reason: DeferReason) -> Self {
        Self {
            status: VerdictStatus::Defer,
            reason: Some(reason),
        }
    }
}

/// What the local node is doing when a peer's request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalView {
    pub node: NodeId,
    pub in_critical_section: bool,
    pub own_request: Option<Timestamp>,
}

/// The grant-or-defer rule. Pure: the caller is responsible for handing it
/// a consistent snapshot of local state.
pub struct PermissionScheduler;

impl PermissionScheduler {
    pub fn decide(local: &LocalView, request: &RequestRecord) -> SchedulerVerdict {
        if local.in_critical_section {
            return SchedulerVerdict::defer(DeferReason::InCriticalSection);
        }

        let Some(own_timestamp) = local.own_request else {
            return SchedulerVerdict::GRANT;
        };

        let own = Claim::new(local.node, own_timestamp);
        if own.outranks(&Claim::from(*request)) {
            SchedulerVerdict::defer(DeferReason::OwnClaimFirst)
        } else {
            SchedulerVerdict::GRANT
        }
    }
}
