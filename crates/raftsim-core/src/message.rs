//! # message
//!
//! why: define all raft rpc message types exchanged between simulated nodes
//! relations: built by the engine's election/replication protocols, carried by its message bus
//! what: MessageKind tag, RaftMessage payloads, NetworkMessage envelope

use serde::{Deserialize, Serialize};

use crate::{ClusterId, LogEntry, NodeId};

/// Wire-level message type, as observers see it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Heartbeat,
    VoteRequest,
    VoteResponse,
    AppendEntries,
    AppendEntriesResponse,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::VoteRequest => "vote_request",
            MessageKind::VoteResponse => "vote_response",
            MessageKind::AppendEntries => "append_entries",
            MessageKind::AppendEntriesResponse => "append_entries_response",
        };
        f.write_str(name)
    }
}

/// Protocol-specific payload. The sender's term travels on the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        last_log_index: Option<u64>,
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse { granted: bool },
    /// Replicate log entries
    AppendEntries {
        prev_log_index: Option<u64>,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: Option<u64>,
    },
    /// Empty append: liveness signal and consistency check
    Heartbeat {
        prev_log_index: Option<u64>,
        prev_log_term: u64,
        leader_commit: Option<u64>,
    },
    /// Response to AppendEntries or Heartbeat
    AppendEntriesResponse {
        success: bool,
        match_index: Option<u64>,
    },
}

impl RaftMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RaftMessage::VoteRequest { .. } => MessageKind::VoteRequest,
            RaftMessage::VoteResponse { .. } => MessageKind::VoteResponse,
            RaftMessage::AppendEntries { .. } => MessageKind::AppendEntries,
            RaftMessage::Heartbeat { .. } => MessageKind::Heartbeat,
            RaftMessage::AppendEntriesResponse { .. } => MessageKind::AppendEntriesResponse,
        }
    }

    /// Outcome flag carried by responses
    pub fn success(&self) -> Option<bool> {
        match self {
            RaftMessage::VoteResponse { granted } => Some(*granted),
            RaftMessage::AppendEntriesResponse { success, .. } => Some(*success),
            _ => None,
        }
    }
}

/// A message as recorded in history and handed to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMessage {
    /// Monotonic id assigned by the bus
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: NodeId,
    pub to: NodeId,
    pub term: u64,
    pub data: RaftMessage,
    pub success: Option<bool>,
    pub cluster_id: ClusterId,
    /// Simulated send time in milliseconds
    pub timestamp: u64,
}

impl NetworkMessage {
    pub fn new(
        id: u64,
        cluster_id: impl Into<ClusterId>,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        term: u64,
        data: RaftMessage,
        timestamp: u64,
    ) -> Self {
        Self {
            id,
            kind: data.kind(),
            from: from.into(),
            to: to.into(),
            term,
            success: data.success(),
            data,
            cluster_id: cluster_id.into(),
            timestamp,
        }
    }
}
