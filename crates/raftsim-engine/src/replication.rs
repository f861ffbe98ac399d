//! # replication
//!
//! why: move client commands from the leader into a majority of logs and commit them
//! relations: runs inside engine.rs's Simulation; per-follower progress lives in cluster.rs
//! what: add_log_entry command, heartbeat/catch-up pass, append and append-response handlers

use raftsim_core::{AppendOutcome, LogEntry, RaftMessage};

use crate::engine::Simulation;
use crate::error::{Result, SimError};

/// Payload of an append or heartbeat as it reaches a follower
#[derive(Debug, Clone, Copy)]
pub(crate) struct AppendRequest<'a> {
    pub prev_log_index: Option<u64>,
    pub prev_log_term: u64,
    pub entries: &'a [LogEntry],
    pub leader_commit: Option<u64>,
}

impl Simulation {
    /// Append a client command on the cluster's live leader and ship it.
    /// Without a live, reachable leader nothing happens.
    pub fn add_log_entry(&mut self, cluster_id: &str, command: &str) -> Result<LogEntry> {
        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| SimError::NoLeader(cluster_id.to_string()))?;
        let leader_id = cluster
            .command_leader()
            .map(|n| n.node_id.clone())
            .ok_or_else(|| SimError::NoLeader(cluster_id.to_string()))?;
        let peers = cluster.peers_of(&leader_id);
        let leader = cluster
            .node_mut(&leader_id)
            .ok_or_else(|| SimError::Internal(format!("leader {leader_id} vanished")))?;

        let prev = leader.last_log_position();
        let entry = leader.append_command(command);
        let term = leader.current_term;
        let leader_commit = leader.commit_index;
        tracing::info!(cluster_id, leader_id = %leader_id, index = entry.index, term, "entry appended");

        // only the newest entry; laggards catch up on the heartbeat pass
        for peer in peers {
            self.send(
                &leader_id,
                &peer,
                term,
                RaftMessage::AppendEntries {
                    prev_log_index: prev.index,
                    prev_log_term: prev.term,
                    entries: vec![entry.clone()],
                    leader_commit,
                },
            );
        }
        self.advance_commit(cluster_id, &leader_id);
        self.mark_dirty(cluster_id);
        self.flush();

        let stored = self
            .node(&leader_id)
            .and_then(|n| n.log.get(entry.index))
            .cloned();
        Ok(stored.unwrap_or(entry))
    }

    /// Catch-up appends for lagging followers, empty heartbeats for the rest
    pub(crate) fn replicate_to_all(&mut self, cluster_id: &str, leader_id: &str) {
        let Some(cluster) = self.clusters.get(cluster_id) else {
            return;
        };
        let Some(leader) = cluster.node(leader_id) else {
            return;
        };
        if !leader.is_leader() || !leader.can_communicate() {
            return;
        }

        let term = leader.current_term;
        let leader_commit = leader.commit_index;
        let log_len = leader.log.len() as u64;
        let max_entries = self.config.max_entries_per_append;

        let mut outgoing = Vec::new();
        for peer in cluster.peers_of(leader_id) {
            let next = cluster
                .progress(leader_id)
                .map_or(log_len, |p| p.next_index(&peer))
                .min(log_len);
            let prev_log_index = next.checked_sub(1);
            let prev_log_term = prev_log_index
                .and_then(|i| leader.log.term_at(i))
                .unwrap_or(0);

            let message = if next < log_len {
                RaftMessage::AppendEntries {
                    prev_log_index,
                    prev_log_term,
                    entries: leader.log.entries_from(next, max_entries),
                    leader_commit,
                }
            } else {
                RaftMessage::Heartbeat {
                    prev_log_index,
                    prev_log_term,
                    leader_commit,
                }
            };
            outgoing.push((peer, message));
        }

        for (peer, message) in outgoing {
            self.send(leader_id, &peer, term, message);
        }
    }

    pub(crate) fn on_heartbeat_tick(&mut self, node_id: &str, epoch: u64) -> Result<()> {
        if !self.timers.is_current_heartbeat(node_id, epoch) {
            tracing::trace!(node_id, epoch, "stale heartbeat timer");
            return Ok(());
        }
        let Some(node) = self.node(node_id) else {
            return Ok(());
        };
        if !node.is_alive || !node.is_leader() {
            return Ok(());
        }
        let cluster_id = node.cluster_id.clone();
        self.replicate_to_all(&cluster_id, node_id);
        self.arm_heartbeat(node_id);
        Ok(())
    }

    /// Follower side of append_entries and heartbeat
    pub(crate) fn on_append(
        &mut self,
        cluster_id: &str,
        follower_id: &str,
        leader_id: &str,
        term: u64,
        request: AppendRequest<'_>,
    ) -> Result<()> {
        let Some(follower) = self.node(follower_id) else {
            return Ok(());
        };
        if term < follower.current_term {
            let reply_term = follower.current_term;
            let last_index = follower.log.last_index();
            tracing::debug!(follower_id, leader_id, term, reply_term, "append from stale leader");
            self.send(
                follower_id,
                leader_id,
                reply_term,
                RaftMessage::AppendEntriesResponse {
                    success: false,
                    match_index: last_index,
                },
            );
            return Ok(());
        }

        self.adopt_term(cluster_id, follower_id, term);
        let now = self.clock.now_ms();
        let rejection_rate = self.config.append_rejection_rate;
        let mode = self.config.log_matching;

        let Some(follower) = self
            .clusters
            .get_mut(cluster_id)
            .and_then(|c| c.node_mut(follower_id))
        else {
            return Ok(());
        };
        // same-term leader contact: candidates give up, and a leader here
        // would be a second leader in one term
        let was_leader = follower.is_leader();
        follower.step_down();
        follower.last_heartbeat_at = now;

        let refused = !request.entries.is_empty()
            && rejection_rate > 0.0
            && self.protocol_rng.next_bool(rejection_rate);
        let outcome = if refused {
            AppendOutcome::Rejected {
                last_index: follower.log.last_index(),
            }
        } else {
            follower.receive_entries(
                request.prev_log_index,
                request.prev_log_term,
                request.entries,
                request.leader_commit,
                mode,
            )
        };
        let reply_term = follower.current_term;

        let (success, match_index) = match outcome {
            AppendOutcome::Accepted { match_index } => (true, match_index),
            AppendOutcome::Rejected { last_index } => (false, last_index),
        };
        tracing::debug!(
            follower_id,
            leader_id,
            term,
            entries = request.entries.len(),
            success,
            refused,
            "append handled"
        );

        if was_leader {
            tracing::warn!(cluster_id, follower_id, term, "leader saw a same-term leader, stepping down");
            self.demote_leader(cluster_id, follower_id);
        } else {
            self.arm_election(follower_id);
        }
        self.mark_dirty(cluster_id);
        self.send(
            follower_id,
            leader_id,
            reply_term,
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
            },
        );
        Ok(())
    }

    /// Leader side: update progress and try to commit
    pub(crate) fn on_append_response(
        &mut self,
        cluster_id: &str,
        leader_id: &str,
        follower_id: &str,
        term: u64,
        success: bool,
        match_index: Option<u64>,
    ) -> Result<()> {
        if self.adopt_term(cluster_id, leader_id, term) {
            return Ok(());
        }
        let Some(leader) = self.node(leader_id) else {
            return Ok(());
        };
        if !leader.is_leader() || term != leader.current_term {
            tracing::trace!(leader_id, follower_id, term, "stale append response");
            return Ok(());
        }

        let Some(progress) = self
            .clusters
            .get_mut(cluster_id)
            .and_then(|c| c.progress_mut(leader_id))
        else {
            return Ok(());
        };
        if success {
            progress.record_success(follower_id, match_index);
            self.advance_commit(cluster_id, leader_id);
        } else {
            progress.record_failure(follower_id, match_index);
            tracing::debug!(leader_id, follower_id, next_index = progress.next_index(follower_id), "follower behind");
        }
        Ok(())
    }

    pub(crate) fn advance_commit(&mut self, cluster_id: &str, leader_id: &str) {
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return;
        };
        if let Some(index) = cluster.advance_commit(leader_id) {
            tracing::debug!(cluster_id, leader_id, index, "commit advanced");
            self.mark_dirty(cluster_id);
        }
    }
}
