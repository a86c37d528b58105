//! Channel-backed network for simulations and tests.
//!
//! Messages go through the real text encoding so that the receiving side
//! decodes exactly what a TCP peer would have sent.

use crate::error::ExecutorError;
use crate::infrastructure::{AccessLog, Inbound, Messenger};
use crate::types::{Message, NodeId, SendOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedSender};

/// One send attempt, as observed by the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
    pub delivered: bool,
}

#[derive(Default)]
struct NetworkInner {
    routes: HashMap<NodeId, UnboundedSender<Vec<u8>>>,
    disconnected: HashSet<NodeId>,
    log: Vec<Envelope>,
}

/// A set of nodes wired together by unbounded channels.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` and returns its outbound handle and inbound stream.
    /// Joining again replaces the previous inbound stream.
    pub fn join(&self, node: NodeId) -> (InMemoryMessenger, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().routes.insert(node, tx);
        let messenger = InMemoryMessenger {
            node,
            network: self.clone(),
        };
        (messenger, rx)
    }

    /// Every send to or from `node` fails until [`Self::reconnect`].
    pub fn disconnect(&self, node: NodeId) {
        self.lock().disconnected.insert(node);
    }

    pub fn reconnect(&self, node: NodeId) {
        self.lock().disconnected.remove(&node);
    }

    /// All send attempts so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.lock().log.clone()
    }

    pub fn sent_by(&self, from: NodeId) -> Vec<Envelope> {
        self.lock()
            .log
            .iter()
            .filter(|envelope| envelope.from == from)
            .cloned()
            .collect()
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: Message) -> SendOutcome {
        let mut inner = self.lock();

        let outcome = if inner.disconnected.contains(&from) || inner.disconnected.contains(&to) {
            SendOutcome::Failed {
                reason: format!("node {to} unreachable from node {from}"),
            }
        } else {
            match inner.routes.get(&to) {
                Some(route) if route.send(message.encode().into_bytes()).is_ok() => {
                    SendOutcome::Delivered
                }
                Some(_) => SendOutcome::Failed {
                    reason: format!("node {to} stopped listening"),
                },
                None => SendOutcome::Failed {
                    reason: format!("node {to} is not on the network"),
                },
            }
        };

        inner.log.push(Envelope {
            from,
            to,
            message,
            delivered: outcome.is_delivered(),
        });
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outbound handle of one node on an [`InMemoryNetwork`].
#[derive(Clone)]
pub struct InMemoryMessenger {
    node: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryMessenger {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Messenger for InMemoryMessenger {
    async fn send(&self, to: NodeId, message: Message) -> SendOutcome {
        self.network.deliver(self.node, to, message)
    }
}

/// Access log kept in memory, in append order.
#[derive(Clone, Default)]
pub struct InMemoryAccessLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl InMemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AccessLog for InMemoryAccessLog {
    async fn append_line(&self, line: &str) -> Result<(), ExecutorError> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}
