//! # node
//!
//! why: define the raft node state machine and its state transitions
//! relations: uses message.rs for rpc payloads, log.rs for entry management, kv.rs for applied state
//! what: Role enum, ClusterNode struct, vote rule, majority, fail/restart/partition transitions

use serde::{Deserialize, Serialize};

use crate::kv::{Applied, StateMachine};
use crate::log::{AppendOutcome, Log, LogEntry, LogMatching, LogPosition};
use crate::message::RaftMessage;
use crate::{ClusterId, NodeId};

/// The three possible roles a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Quorum size for `alive` live nodes: ⌊alive/2⌋+1
pub fn majority(alive: usize) -> usize {
    alive / 2 + 1
}

/// The vote-granting rule.
///
/// Grant iff the request term is strictly newer than the voter's term, the
/// voter has not voted for someone else in the request term, and the
/// candidate's log is at least as up to date as the voter's.
pub fn grants_vote(
    request_term: u64,
    candidate_id: &str,
    candidate_log: LogPosition,
    voter_term: u64,
    voter_voted_for: Option<&str>,
    voter_log: LogPosition,
) -> bool {
    request_term > voter_term
        && voter_voted_for.map_or(true, |v| v == candidate_id)
        && candidate_log.is_at_least_as_up_to_date_as(&voter_log)
}

/// A single simulated member of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub node_id: NodeId,
    pub cluster_id: ClusterId,
    pub role: Role,
    /// Election epoch, only moves forward except on restart
    pub current_term: u64,
    /// Candidate voted for in `current_term`
    pub voted_for: Option<NodeId>,
    pub log: Log,
    /// Highest committed index, `None` while nothing is committed
    pub commit_index: Option<u64>,
    /// Highest index applied to `kv`, never above `commit_index`
    pub last_applied: Option<u64>,
    pub is_alive: bool,
    pub is_partitioned: bool,
    /// Meaningful only while candidate
    pub votes_received: u32,
    /// Simulated ms of the last leader contact (or election win)
    pub last_heartbeat_at: u64,
    pub kv: StateMachine,
}

impl ClusterNode {
    /// Create a new node in Follower state at term 0
    pub fn new(node_id: impl Into<NodeId>, cluster_id: impl Into<ClusterId>, now_ms: u64) -> Self {
        Self {
            node_id: node_id.into(),
            cluster_id: cluster_id.into(),
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            log: Log::new(),
            commit_index: None,
            last_applied: None,
            is_alive: true,
            is_partitioned: false,
            votes_received: 0,
            last_heartbeat_at: now_ms,
            kv: StateMachine::new(),
        }
    }

    /// Alive and not partitioned: may send and receive protocol messages
    pub fn can_communicate(&self) -> bool {
        self.is_alive && !self.is_partitioned
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn last_log_position(&self) -> LogPosition {
        self.log.last_position()
    }

    /// The vote this node cast in `term`, if any
    pub fn vote_in(&self, term: u64) -> Option<&str> {
        if term == self.current_term {
            self.voted_for.as_deref()
        } else {
            None
        }
    }

    /// Become a candidate for the next term and vote for ourselves.
    /// Returns the vote request to fan out.
    pub fn start_election(&mut self) -> RaftMessage {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node_id.clone());
        self.votes_received = 1;

        let last = self.last_log_position();
        RaftMessage::VoteRequest {
            last_log_index: last.index,
            last_log_term: last.term,
        }
    }

    /// Evaluate a vote request. Granting adopts the request term and
    /// records the vote; a denial changes nothing.
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: &str,
        candidate_log: LogPosition,
    ) -> bool {
        let granted = grants_vote(
            term,
            candidate_id,
            candidate_log,
            self.current_term,
            self.vote_in(term),
            self.last_log_position(),
        );
        if granted {
            self.current_term = term;
            self.voted_for = Some(candidate_id.to_string());
            self.role = Role::Follower;
            self.votes_received = 0;
        }
        granted
    }

    /// Count a vote response. Returns true only if it was counted: we are
    /// still a candidate in `term` and the vote was granted.
    pub fn handle_vote_response(&mut self, term: u64, granted: bool) -> bool {
        if self.role != Role::Candidate || term != self.current_term || !granted {
            return false;
        }
        self.votes_received += 1;
        true
    }

    pub fn has_majority(&self, majority: usize) -> bool {
        self.role == Role::Candidate && self.votes_received as usize >= majority
    }

    pub fn become_leader(&mut self, now_ms: u64) {
        self.role = Role::Leader;
        self.last_heartbeat_at = now_ms;
    }

    /// Revert to follower without touching the term
    pub fn step_down(&mut self) {
        self.role = Role::Follower;
        self.votes_received = 0;
    }

    /// Adopt a newer term, dropping the old vote. Returns true if the term moved.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        self.current_term = term;
        self.voted_for = None;
        self.step_down();
        true
    }

    /// Leader-side append of a client command
    pub fn append_command(&mut self, command: impl Into<String>) -> LogEntry {
        self.log.append_command(self.current_term, command).clone()
    }

    /// Follower-side append, then follow the leader's commit index as far
    /// as the matched prefix allows.
    pub fn receive_entries(
        &mut self,
        prev_log_index: Option<u64>,
        prev_log_term: u64,
        entries: &[LogEntry],
        leader_commit: Option<u64>,
        mode: LogMatching,
    ) -> AppendOutcome {
        let outcome = self.log.offer(
            prev_log_index,
            prev_log_term,
            entries,
            mode,
            self.commit_index,
        );
        if let AppendOutcome::Accepted {
            match_index: Some(matched),
        } = outcome
        {
            if let Some(leader_commit) = leader_commit {
                self.commit_through(leader_commit.min(matched));
            }
        }
        outcome
    }

    pub fn holds(&self, index: u64, term: u64) -> bool {
        self.log.holds(index, term)
    }

    /// Raise `commit_index` to `through` (clamped to the log) and apply
    /// newly committed entries. Returns true if anything advanced.
    pub fn commit_through(&mut self, through: u64) -> bool {
        if self.commit_index.is_some_and(|c| c >= through) {
            return false;
        }
        let Some(committed) = self.log.commit_through(through) else {
            return false;
        };
        if self.commit_index.is_some_and(|c| c >= committed) {
            return false;
        }
        self.commit_index = Some(committed);
        self.apply_committed();
        true
    }

    fn apply_committed(&mut self) {
        let Some(commit) = self.commit_index else {
            return;
        };
        let mut next = self.last_applied.map_or(0, |a| a + 1);
        while next <= commit {
            if let Some(entry) = self.log.get(next) {
                if let Applied::Ignored(reason) = self.kv.apply(&entry.command) {
                    tracing::debug!(node_id = %self.node_id, index = next, %reason, "committed entry is not a command");
                }
            }
            self.last_applied = Some(next);
            next += 1;
        }
    }

    /// Crash: dead, forced follower, vote bookkeeping dropped. Term and log survive.
    pub fn fail(&mut self) {
        self.is_alive = false;
        self.role = Role::Follower;
        self.voted_for = None;
        self.votes_received = 0;
    }

    /// Come back with empty volatile and persistent state
    pub fn restart(&mut self, now_ms: u64) {
        self.is_alive = true;
        self.role = Role::Follower;
        self.current_term = 0;
        self.voted_for = None;
        self.votes_received = 0;
        self.log.clear();
        self.commit_index = None;
        self.last_applied = None;
        self.last_heartbeat_at = now_ms;
        self.kv.clear();
    }

    /// Flip partition state, role untouched. Returns the new state.
    pub fn toggle_partition(&mut self) -> bool {
        self.is_partitioned = !self.is_partitioned;
        self.is_partitioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = ClusterNode::new("node-1", "c1", 0);
        assert_eq!(node.role, Role::Follower);
        assert_eq!(node.current_term, 0);
        assert_eq!(node.voted_for, None);
        assert_eq!(node.commit_index, None);
        assert!(node.can_communicate());
    }

    #[test]
    fn majority_of_alive() {
        assert_eq!(majority(0), 1);
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn commit_applies_in_order() {
        let mut node = ClusterNode::new("node-1", "c1", 0);
        node.current_term = 1;
        node.append_command("SET a=1");
        node.append_command("SET a=2");
        assert!(node.commit_through(1));
        assert_eq!(node.last_applied, Some(1));
        assert_eq!(node.kv.get("a"), Some("2"));
        assert!(!node.commit_through(0));
    }
}
