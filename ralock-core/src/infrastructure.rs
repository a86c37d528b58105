use crate::error::ExecutorError;
use crate::types::{Message, NodeId, SendOutcome};
use std::future::Future;
use tokio::sync::mpsc;

/// Raw inbound payloads, one per accepted connection, in arrival order.
pub type Inbound = mpsc::UnboundedReceiver<Vec<u8>>;

/// Defines the contract for delivering protocol messages to peers.
///
/// A send is one attempt: no retry, no acknowledgement, no ordering across
/// peers. Callers must not assume delivery; a failed send is reported, not
/// raised.
pub trait Messenger: Send + Sync {
    fn send(&self, to: NodeId, message: Message) -> impl Future<Output = SendOutcome> + Send;
}

/// Append-only shared log written from inside the critical section.
///
/// Implementations provide their own mutual exclusion for the physical
/// write; the protocol does not rely on it.
pub trait AccessLog: Send + Sync {
    fn append_line(&self, line: &str) -> impl Future<Output = Result<(), ExecutorError>> + Send;
}
