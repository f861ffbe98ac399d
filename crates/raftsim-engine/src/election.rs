//! # election
//!
//! why: orchestrate candidacy, vote solicitation, tallying and the leader transition
//! relations: runs inside engine.rs's Simulation; node-level rules come from raftsim-core's node.rs
//! what: start_election command, election timeout handler, vote request/response handlers

use raftsim_core::{grants_vote, LogPosition, RaftMessage};

use crate::engine::Simulation;
use crate::error::{Result, SimError};
use crate::events::EngineEvent;

impl Simulation {
    /// Force a node to stand for election now, as if its timer fired.
    /// Partitioned nodes may stand; they just cannot reach anyone.
    pub fn start_election(&mut self, node_id: &str) -> Result<()> {
        let node = self
            .node(node_id)
            .ok_or_else(|| SimError::NodeNotFound(node_id.to_string()))?;
        if !node.is_alive {
            return Err(SimError::NodeDown(node_id.to_string()));
        }
        let cluster_id = node.cluster_id.clone();
        self.begin_candidacy(&cluster_id, node_id);
        self.flush();
        Ok(())
    }

    pub(crate) fn on_election_timeout(&mut self, node_id: &str, epoch: u64) -> Result<()> {
        if !self.timers.is_current_election(node_id, epoch) {
            tracing::trace!(node_id, epoch, "stale election timer");
            return Ok(());
        }
        let Some(node) = self.node(node_id) else {
            return Ok(());
        };
        if !node.is_alive || node.is_leader() {
            return Ok(());
        }

        tracing::info!(
            node_id,
            term = node.current_term,
            role = %node.role,
            "election timeout, starting election"
        );
        let cluster_id = node.cluster_id.clone();
        self.begin_candidacy(&cluster_id, node_id);
        Ok(())
    }

    /// Next term, self vote, fresh timer, then fan out vote requests
    fn begin_candidacy(&mut self, cluster_id: &str, node_id: &str) {
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return;
        };
        let Some(node) = cluster.node_mut(node_id) else {
            return;
        };
        let was_leader = node.is_leader();
        let request = node.start_election();
        let term = node.current_term;
        let peers = cluster.peers_of(node_id);

        tracing::info!(cluster_id, node_id, term, "became candidate");
        if was_leader {
            self.cancel_heartbeat(node_id);
            if let Some(cluster) = self.clusters.get_mut(cluster_id) {
                cluster.drop_progress(node_id);
            }
        }
        // a lost or split election retries when this fires
        self.arm_election(node_id);
        self.mark_dirty(cluster_id);

        if self.try_win(cluster_id, node_id) {
            return;
        }
        for peer in peers {
            self.send(node_id, &peer, term, request.clone());
        }
    }

    pub(crate) fn on_vote_request(
        &mut self,
        cluster_id: &str,
        voter_id: &str,
        candidate_id: &str,
        term: u64,
        candidate_log: LogPosition,
    ) -> Result<()> {
        let refusal_rate = self.config.vote_refusal_rate;
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return Ok(());
        };
        let Some(voter) = cluster.node_mut(voter_id) else {
            return Ok(());
        };

        let eligible = grants_vote(
            term,
            candidate_id,
            candidate_log,
            voter.current_term,
            voter.vote_in(term),
            voter.last_log_position(),
        );
        let refused = eligible && refusal_rate > 0.0 && self.protocol_rng.next_bool(refusal_rate);
        let was_leader = voter.is_leader();
        let granted = eligible && !refused && voter.handle_vote_request(term, candidate_id, candidate_log);
        let reply_term = voter.current_term;

        tracing::debug!(
            voter_id,
            candidate_id,
            term,
            granted,
            refused,
            "vote request evaluated"
        );
        if granted {
            if was_leader {
                self.demote_leader(cluster_id, voter_id);
            } else {
                self.arm_election(voter_id);
            }
            self.mark_dirty(cluster_id);
        }
        self.send(
            voter_id,
            candidate_id,
            reply_term,
            RaftMessage::VoteResponse { granted },
        );
        Ok(())
    }

    pub(crate) fn on_vote_response(
        &mut self,
        cluster_id: &str,
        candidate_id: &str,
        term: u64,
        granted: bool,
    ) -> Result<()> {
        if self.adopt_term(cluster_id, candidate_id, term) {
            return Ok(());
        }
        let Some(candidate) = self
            .clusters
            .get_mut(cluster_id)
            .and_then(|c| c.node_mut(candidate_id))
        else {
            return Ok(());
        };
        if !candidate.handle_vote_response(term, granted) {
            tracing::trace!(candidate_id, term, granted, "vote response ignored");
            return Ok(());
        }

        tracing::debug!(
            candidate_id,
            term,
            votes = candidate.votes_received,
            "vote received"
        );
        self.mark_dirty(cluster_id);
        self.try_win(cluster_id, candidate_id);
        Ok(())
    }

    /// Promote the candidate if its votes reach a majority of live nodes
    fn try_win(&mut self, cluster_id: &str, candidate_id: &str) -> bool {
        let Some(cluster) = self.clusters.get(cluster_id) else {
            return false;
        };
        let majority = cluster.majority();
        let won = cluster
            .node(candidate_id)
            .is_some_and(|n| n.is_alive && n.has_majority(majority));
        if won {
            self.become_leader(cluster_id, candidate_id);
        }
        won
    }

    fn become_leader(&mut self, cluster_id: &str, leader_id: &str) {
        let now = self.clock.now_ms();
        let Some(cluster) = self.clusters.get_mut(cluster_id) else {
            return;
        };
        let Some(leader) = cluster.node_mut(leader_id) else {
            return;
        };
        leader.become_leader(now);
        let term = leader.current_term;
        let votes = leader.votes_received;

        let rivals = cluster.candidates_except(leader_id);
        for rival in &rivals {
            if let Some(node) = cluster.node_mut(rival) {
                node.step_down();
            }
        }
        cluster.reset_progress(leader_id);

        tracing::info!(cluster_id, leader_id, term, votes, "became leader");
        self.cancel_election(leader_id);
        for rival in &rivals {
            self.arm_election(rival);
        }
        self.events.publish(EngineEvent::LeaderElected {
            cluster_id: cluster_id.to_string(),
            leader_id: leader_id.to_string(),
            term,
        });
        self.mark_dirty(cluster_id);

        self.replicate_to_all(cluster_id, leader_id);
        self.arm_heartbeat(leader_id);
    }
}
