//! # ralock-core
//!
//! Permission-based distributed mutual exclusion. Every node asks every
//! other node for permission, answers requests from peers right away or
//! defers them until it leaves the critical section, and enters only once
//! all peers have granted.
//!
//! The protocol itself is the pure [`state::CoordinatorState`] machine over
//! the [`scheduler::PermissionScheduler`] rule. [`coordinator::Coordinator`]
//! drives it asynchronously over a pluggable [`infrastructure::Messenger`].

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "tcp")]
#[path = "infrastructure_tcp.rs"]
pub mod infrastructure_tcp;
pub mod priority;
pub mod scheduler;
pub mod state;
pub mod topology;
pub mod types;
pub mod wire;

#[cfg(test)]
mod state_test;
