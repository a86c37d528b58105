use crate::error::CoordinatorError;
use crate::scheduler::{LocalView, PermissionScheduler, SchedulerVerdict, VerdictStatus};
use crate::types::{Message, NodeId, Outbound, Phase, RequestRecord, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Point-in-time copy of a node's protocol state, for logs and status output.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub node: NodeId,
    pub phase: Phase,
    pub in_critical_section: bool,
    pub own_request: Option<Timestamp>,
    pub grants_received: usize,
    pub grants_needed: usize,
    pub deferred: Vec<RequestRecord>,
    /// Grants still expected for withdrawn requests, per peer
    pub stale_grants_owed: BTreeMap<NodeId, usize>,
}

/// Effects of starting a request cycle.
#[derive(Debug, Clone)]
pub struct RequestStart {
    pub timestamp: Timestamp,
    /// One REQUEST per peer
    pub broadcast: Vec<Outbound>,
    /// Grants owed to requesters left over from an earlier cycle
    pub flushed: Vec<Outbound>,
    /// Set when there are no peers to ask
    pub entered: bool,
}

/// Effects of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// REQUEST answered immediately
    Granted(Outbound),
    /// REQUEST queued until release
    Deferred(SchedulerVerdict),
    /// GRANT tallied; quorum not reached yet
    Counted { received: usize, needed: usize },
    /// GRANT tallied and quorum reached; the node now holds the resource
    Entered,
    /// GRANT answered a withdrawn request and was not counted
    Stale,
    /// GRANT arrived while no request was outstanding
    Ignored,
}

/// Protocol state of one node. Every method is a single atomic transition;
/// the owner must serialize calls.
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    node: NodeId,
    peers: Vec<NodeId>,
    phase: Phase,
    own_request: Option<Timestamp>,
    grants_received: usize,
    /// Peers that granted the current request
    granted: BTreeSet<NodeId>,
    /// Peers the current REQUEST never reached
    unreached: BTreeSet<NodeId>,
    stale_owed: BTreeMap<NodeId, usize>,
    deferred: VecDeque<RequestRecord>,
}

impl CoordinatorState {
    pub fn new(node: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node,
            peers,
            phase: Phase::Idle,
            own_request: None,
            grants_received: 0,
            granted: BTreeSet::new(),
            unreached: BTreeSet::new(),
            stale_owed: BTreeMap::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn in_critical_section(&self) -> bool {
        self.phase == Phase::InCriticalSection
    }

    pub fn own_request(&self) -> Option<Timestamp> {
        self.own_request
    }

    pub fn grants_received(&self) -> usize {
        self.grants_received
    }

    /// Cluster size minus one.
    pub fn grants_needed(&self) -> usize {
        self.peers.len()
    }

    pub fn deferred(&self) -> impl ExactSizeIterator<Item = &RequestRecord> {
        self.deferred.iter()
    }

    /// IDLE -> REQUESTING. Returns the REQUEST broadcast for the caller to send.
    pub fn begin_request(&mut self, now: Timestamp) -> Result<RequestStart, CoordinatorError> {
        if self.phase != Phase::Idle {
            return Err(CoordinatorError::AlreadyActive { phase: self.phase });
        }

        // An idle node never defers, so this is empty unless a previous cycle
        // was cut short. Those requesters are still waiting on us.
        let flushed = self.drain_deferred();

        self.own_request = Some(now);
        self.grants_received = 0;
        self.granted.clear();
        self.unreached.clear();
        self.phase = Phase::Requesting;

        let request = Message::Request(RequestRecord::new(self.node, now));
        let broadcast = self
            .peers
            .iter()
            .map(|&to| Outbound {
                to,
                message: request,
            })
            .collect();

        let entered = self.try_enter();

        Ok(RequestStart {
            timestamp: now,
            broadcast,
            flushed,
            entered,
        })
    }

    pub fn on_message(&mut self, message: Message) -> Step {
        match message {
            Message::Request(record) => self.on_request(record),
            Message::Grant { granter } => self.on_grant(granter),
        }
    }

    pub fn on_request(&mut self, record: RequestRecord) -> Step {
        let verdict = PermissionScheduler::decide(&self.local_view(), &record);
        match verdict.status {
            VerdictStatus::Grant => Step::Granted(Outbound::grant(record.requester, self.node)),
            VerdictStatus::Defer => {
                self.deferred.push_back(record);
                Step::Deferred(verdict)
            }
        }
    }

    /// Records that the REQUEST of the current cycle could not be sent to
    /// `peer`, so no grant for it will ever arrive.
    pub fn mark_unreached(&mut self, peer: NodeId) {
        if self.phase == Phase::Requesting {
            self.unreached.insert(peer);
        }
    }

    /// A grant owed for a withdrawn request is consumed first and never
    /// counts. Otherwise grants are taken at face value: duplicates are not
    /// checked and only bring quorum forward.
    pub fn on_grant(&mut self, granter: NodeId) -> Step {
        if let Some(owed) = self.stale_owed.get_mut(&granter) {
            *owed -= 1;
            if *owed == 0 {
                self.stale_owed.remove(&granter);
            }
            return Step::Stale;
        }
        if self.phase != Phase::Requesting {
            return Step::Ignored;
        }

        self.grants_received += 1;
        self.granted.insert(granter);
        if self.try_enter() {
            Step::Entered
        } else {
            Step::Counted {
                received: self.grants_received,
                needed: self.grants_needed(),
            }
        }
    }

    /// IN_CRITICAL_SECTION -> IDLE. Returns one GRANT per deferred requester,
    /// in arrival order.
    pub fn release(&mut self) -> Vec<Outbound> {
        let grants = self.drain_deferred();
        self.phase = Phase::Idle;
        self.own_request = None;
        self.grants_received = 0;
        self.granted.clear();
        self.unreached.clear();
        grants
    }

    /// Gives up an outstanding request. Returns `None` when quorum was already
    /// reached, in which case the node holds the resource and must release it
    /// normally.
    ///
    /// Every peer that was sent the REQUEST but has not granted it still owes
    /// a grant. That grant is recorded so it cannot count toward a later
    /// request.
    pub fn withdraw(&mut self) -> Option<Vec<Outbound>> {
        match self.phase {
            Phase::InCriticalSection => None,
            Phase::Idle => Some(self.release()),
            Phase::Requesting => {
                for &peer in &self.peers {
                    if !self.granted.contains(&peer) && !self.unreached.contains(&peer) {
                        *self.stale_owed.entry(peer).or_insert(0) += 1;
                    }
                }
                Some(self.release())
            }
        }
    }

    /// Grants expected for withdrawn requests that have not arrived yet.
    pub fn stale_grants_owed(&self, peer: NodeId) -> usize {
        self.stale_owed.get(&peer).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            node: self.node,
            phase: self.phase,
            in_critical_section: self.in_critical_section(),
            own_request: self.own_request,
            grants_received: self.grants_received,
            grants_needed: self.grants_needed(),
            deferred: self.deferred.iter().copied().collect(),
            stale_grants_owed: self.stale_owed.clone(),
        }
    }

    fn local_view(&self) -> LocalView {
        LocalView {
            node: self.node,
            in_critical_section: self.in_critical_section(),
            own_request: self.own_request,
        }
    }

    fn try_enter(&mut self) -> bool {
        if self.phase == Phase::Requesting && self.grants_received >= self.grants_needed() {
            self.phase = Phase::InCriticalSection;
            true
        } else {
            false
        }
    }

    fn drain_deferred(&mut self) -> Vec<Outbound> {
        self.deferred
            .drain(..)
            .map(|record| Outbound::grant(record.requester, self.node))
            .collect()
    }
}
