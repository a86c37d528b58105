//! Async driver for the protocol state machine.
//!
//! Wraps a [`CoordinatorState`] behind one mutex and a pluggable
//! [`Messenger`]. The outbound cycle (`request_access`) and the inbound loop
//! (`run_inbound`) run as separate tasks over a shared `Arc<Coordinator>`.
//! Every decision is taken while holding the mutex; messages are sent after
//! it is released.

use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::error::{CoordinatorError, TopologyError};
use crate::executor::CriticalSection;
use crate::infrastructure::{Inbound, Messenger};
use crate::state::{CoordinatorState, StateSnapshot, Step};
use crate::topology::Topology;
use crate::types::{Message, NodeId, Outbound, SendOutcome, Timestamp};

/// A request that reached quorum. The node holds the resource until
/// [`Coordinator::release_access`].
#[derive(Debug, Clone, Copy)]
pub struct Acquired {
    pub timestamp: Timestamp,
    pub waited: Duration,
}

/// Summary of one full request cycle.
#[derive(Debug, Clone)]
pub struct AccessReport {
    pub timestamp: Timestamp,
    pub waited: Duration,
    /// Deferred requesters granted on release, in the order they were granted
    pub released_to: Vec<NodeId>,
}

pub struct Coordinator<M> {
    node: NodeId,
    state: Mutex<CoordinatorState>,
    quorum: Notify,
    messenger: M,
    request_timeout: Option<Duration>,
}

impl<M: Messenger> Coordinator<M> {
    pub fn new(node: NodeId, peers: Vec<NodeId>, messenger: M) -> Self {
        Self {
            node,
            state: Mutex::new(CoordinatorState::new(node, peers)),
            quorum: Notify::new(),
            messenger,
            request_timeout: None,
        }
    }

    pub fn from_topology(
        node: NodeId,
        topology: &Topology,
        messenger: M,
    ) -> Result<Self, TopologyError> {
        Ok(Self::new(node, topology.peers_of(node)?, messenger))
    }

    /// Bounds how long [`Self::acquire`] waits for quorum. `None` waits
    /// forever.
    pub fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn messenger(&self) -> &M {
        &self.messenger
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.lock().await.snapshot()
    }

    /// One full cycle: acquire, run `section`, release.
    ///
    /// The release happens even if `section` fails; its error is returned
    /// afterwards.
    pub async fn request_access<C: CriticalSection>(
        &self,
        section: &C,
    ) -> Result<AccessReport, CoordinatorError> {
        let acquired = self.acquire().await?;
        let outcome = section.enter(self.node).await;
        let released_to = self.release_access().await;
        outcome?;

        Ok(AccessReport {
            timestamp: acquired.timestamp,
            waited: acquired.waited,
            released_to,
        })
    }

    /// Broadcasts a REQUEST and waits until every peer has granted it.
    ///
    /// Peers that cannot be reached are skipped; without a request timeout
    /// the wait then never ends.
    pub async fn acquire(&self) -> Result<Acquired, CoordinatorError> {
        let start = self.state.lock().await.begin_request(Timestamp::now())?;
        let started = Instant::now();

        tracing::info!(node = %self.node, timestamp = %start.timestamp, "Requesting access");

        self.dispatch(&start.flushed).await;
        let unreached = self.dispatch(&start.broadcast).await;
        if !unreached.is_empty() {
            let mut state = self.state.lock().await;
            for peer in unreached {
                state.mark_unreached(peer);
            }
        }

        match self.request_timeout {
            None => self.wait_for_quorum().await,
            Some(limit) => {
                if tokio::time::timeout(limit, self.wait_for_quorum())
                    .await
                    .is_err()
                {
                    self.withdraw(started.elapsed()).await?;
                }
            }
        }

        let waited = started.elapsed();
        tracing::info!(node = %self.node, ?waited, "Entered critical section");

        Ok(Acquired {
            timestamp: start.timestamp,
            waited,
        })
    }

    /// Leaves the critical section and grants every deferred requester, in
    /// arrival order. Returns who was granted.
    pub async fn release_access(&self) -> Vec<NodeId> {
        let grants = self.state.lock().await.release();
        self.dispatch(&grants).await;

        let released_to: Vec<NodeId> = grants.iter().map(|grant| grant.to).collect();
        tracing::info!(node = %self.node, deferred = released_to.len(), "Released shared resource");
        released_to
    }

    /// Applies one decoded message and sends any immediate reply.
    pub async fn handle_inbound(&self, message: Message) -> Step {
        let step = self.state.lock().await.on_message(message);

        match (&step, message) {
            (Step::Granted(grant), Message::Request(record)) => {
                tracing::debug!(node = %self.node, requester = %record.requester, "Granting request");
                self.send(*grant).await;
            }
            (Step::Deferred(verdict), Message::Request(record)) => {
                tracing::info!(
                    node = %self.node,
                    requester = %record.requester,
                    reason = ?verdict.reason,
                    "Deferred request"
                );
            }
            (Step::Counted { received, needed }, Message::Grant { granter }) => {
                tracing::debug!(node = %self.node, %granter, received, needed, "Grant received");
            }
            (Step::Entered, _) => self.quorum.notify_one(),
            (Step::Stale, Message::Grant { granter }) => {
                tracing::debug!(node = %self.node, %granter, "Discarding grant for a withdrawn request");
            }
            (Step::Ignored, Message::Grant { granter }) => {
                tracing::debug!(node = %self.node, %granter, "Ignoring grant with no outstanding request");
            }
            _ => {}
        }

        step
    }

    /// Decodes and applies a raw payload. Malformed payloads are dropped.
    pub async fn handle_raw(&self, raw: &[u8]) -> Option<Step> {
        match Message::decode(raw) {
            Ok(message) => Some(self.handle_inbound(message).await),
            Err(e) => {
                tracing::debug!(
                    node = %self.node,
                    error = %e,
                    payload = %String::from_utf8_lossy(raw),
                    "Discarding malformed message"
                );
                None
            }
        }
    }

    /// Processes inbound payloads until the stream ends.
    pub async fn run_inbound(&self, mut inbound: Inbound) {
        while let Some(raw) = inbound.recv().await {
            self.handle_raw(&raw).await;
        }
        tracing::debug!(node = %self.node, "Inbound stream closed");
    }

    async fn wait_for_quorum(&self) {
        loop {
            if self.state.lock().await.in_critical_section() {
                return;
            }
            // A stale permit from an earlier cycle only costs one extra check.
            self.quorum.notified().await;
        }
    }

    /// Gives up after a timeout, unless quorum arrived in the meantime.
    async fn withdraw(&self, waited: Duration) -> Result<(), CoordinatorError> {
        let (grants, needed, released) = {
            let mut state = self.state.lock().await;
            let grants = state.grants_received();
            let needed = state.grants_needed();
            match state.withdraw() {
                Some(released) => (grants, needed, released),
                None => return Ok(()),
            }
        };

        tracing::warn!(node = %self.node, grants, needed, "Request timed out; withdrawing");
        self.dispatch(&released).await;

        Err(CoordinatorError::QuorumTimeout {
            waited,
            grants,
            needed,
        })
    }

    /// Sends each message in order. Returns the recipients that could not
    /// be reached.
    async fn dispatch(&self, outbound: &[Outbound]) -> Vec<NodeId> {
        let mut failed = Vec::new();
        for item in outbound {
            if !self.send(*item).await.is_delivered() {
                failed.push(item.to);
            }
        }
        failed
    }

    async fn send(&self, outbound: Outbound) -> SendOutcome {
        let outcome = self.messenger.send(outbound.to, outbound.message).await;
        if let SendOutcome::Failed { reason } = &outcome {
            tracing::warn!(
                node = %self.node,
                peer = %outbound.to,
                message = %outbound.message,
                %reason,
                "Send failed, not retrying"
            );
        }
        outcome
    }
}
