//! # raftsim-core
//!
//! why: model the raft node state machine as plain data with no clock and no randomness
//! relations: driven by raftsim-engine, which owns timers, delivery and fault injection
//! what: node roles and transitions, the vote rule, the replicated log, wire messages, applied kv state

pub mod kv;
pub mod log;
pub mod message;
pub mod node;

pub use kv::{Applied, StateMachine};
pub use log::{AppendOutcome, Log, LogEntry, LogMatching, LogPosition};
pub use message::{MessageKind, NetworkMessage, RaftMessage};
pub use node::{grants_vote, majority, ClusterNode, Role};

/// Stable identity of a simulated node, e.g. `node-1`
pub type NodeId = String;

/// Identity of a simulated cluster; nodes only talk within their cluster
pub type ClusterId = String;
