//! # cluster
//!
//! why: keep a cluster's nodes and each leader's view of its followers together
//! relations: owned by engine.rs per cluster id; wraps raftsim-core ClusterNode
//! what: Cluster aggregate, alive majority, command leader, LeaderProgress, commit advancement

use std::collections::{BTreeMap, HashMap};

use raftsim_core::{majority, ClusterNode, NodeId, Role};

/// What a leader knows about each follower's log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderProgress {
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, Option<u64>>,
}

impl LeaderProgress {
    /// Fresh progress after an election: every peer is assumed to be caught up
    pub fn new<'a>(peers: impl IntoIterator<Item = &'a NodeId>, log_len: u64) -> Self {
        let mut progress = Self::default();
        for peer in peers {
            progress.next_index.insert(peer.clone(), log_len);
            progress.match_index.insert(peer.clone(), None);
        }
        progress
    }

    /// First index to send to `peer`
    pub fn next_index(&self, peer: &str) -> u64 {
        self.next_index.get(peer).copied().unwrap_or(0)
    }

    pub fn match_index(&self, peer: &str) -> Option<u64> {
        self.match_index.get(peer).copied().flatten()
    }

    pub fn record_success(&mut self, peer: &str, matched: Option<u64>) {
        let best = self.match_index(peer).max(matched);
        self.match_index.insert(peer.to_string(), best);
        self.next_index
            .insert(peer.to_string(), best.map_or(0, |m| m + 1));
    }

    /// Walk `next_index` back one step, or straight to just past the
    /// follower's last entry when that is further back.
    pub fn record_failure(&mut self, peer: &str, follower_last: Option<u64>) {
        let hint = follower_last.map_or(0, |i| i + 1);
        let next = self.next_index(peer).saturating_sub(1).min(hint);
        self.next_index.insert(peer.to_string(), next);
        let matched = self.match_index(peer).min(follower_last);
        self.match_index.insert(peer.to_string(), matched);
    }

    pub fn forget(&mut self, peer: &str) {
        self.next_index.remove(peer);
        self.match_index.remove(peer);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cluster {
    nodes: BTreeMap<NodeId, ClusterNode>,
    progress: HashMap<NodeId, LeaderProgress>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, node_id: &str) -> Option<&ClusterNode> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(node_id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns false if the id is already taken
    pub fn insert(&mut self, node: ClusterNode) -> bool {
        if self.nodes.contains_key(&node.node_id) {
            return false;
        }
        self.nodes.insert(node.node_id.clone(), node);
        true
    }

    pub fn remove(&mut self, node_id: &str) -> Option<ClusterNode> {
        self.progress.remove(node_id);
        for progress in self.progress.values_mut() {
            progress.forget(node_id);
        }
        self.nodes.remove(node_id)
    }

    pub fn alive_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_alive).count()
    }

    /// Quorum over the nodes alive right now
    pub fn majority(&self) -> usize {
        majority(self.alive_count())
    }

    /// Every other member, reachable or not
    pub fn peers_of(&self, node_id: &str) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| id.as_str() != node_id)
            .cloned()
            .collect()
    }

    /// All nodes currently in the leader role, dead ones excluded
    pub fn leaders(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes
            .values()
            .filter(|n| n.is_alive && n.role == Role::Leader)
    }

    /// The leader a client command should go to: alive, reachable, and on
    /// the newest term when a stale leader is still cut off somewhere.
    pub fn command_leader(&self) -> Option<&ClusterNode> {
        self.leaders()
            .filter(|n| !n.is_partitioned)
            .max_by_key(|n| n.current_term)
    }

    /// Ids of candidates other than `except`
    pub fn candidates_except(&self, except: &str) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.role == Role::Candidate && n.node_id != except)
            .map(|n| n.node_id.clone())
            .collect()
    }

    pub fn progress(&self, leader_id: &str) -> Option<&LeaderProgress> {
        self.progress.get(leader_id)
    }

    pub fn progress_mut(&mut self, leader_id: &str) -> Option<&mut LeaderProgress> {
        self.progress.get_mut(leader_id)
    }

    /// Start tracking followers for a newly elected leader
    pub fn reset_progress(&mut self, leader_id: &str) {
        let Some(leader) = self.nodes.get(leader_id) else {
            return;
        };
        let log_len = leader.log.len() as u64;
        let peers = self.peers_of(leader_id);
        self.progress
            .insert(leader_id.to_string(), LeaderProgress::new(&peers, log_len));
    }

    pub fn drop_progress(&mut self, leader_id: &str) {
        self.progress.remove(leader_id);
    }

    /// Commit the highest entry of `leader_id`'s log that a majority of
    /// alive nodes hold with the same index and term. Every alive holder
    /// raises its commit index to it. Returns the newly committed index.
    pub fn advance_commit(&mut self, leader_id: &str) -> Option<u64> {
        let leader = self.nodes.get(leader_id)?;
        let last = leader.log.last_index()?;
        let floor = leader.commit_index.map_or(0, |c| c + 1);
        let needed = self.majority();

        let target = (floor..=last).rev().find_map(|index| {
            let term = leader.log.term_at(index)?;
            let holders = self
                .nodes
                .values()
                .filter(|n| n.is_alive && n.holds(index, term))
                .count();
            (holders >= needed).then_some((index, term))
        })?;

        let (index, term) = target;
        for node in self.nodes.values_mut() {
            if node.is_alive && node.holds(index, term) {
                node.commit_through(index);
            }
        }
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Cluster {
        let mut cluster = Cluster::new();
        for id in ["node-1", "node-2", "node-3"] {
            assert!(cluster.insert(ClusterNode::new(id, "c1", 0)));
        }
        cluster
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let mut cluster = three_nodes();
        assert!(!cluster.insert(ClusterNode::new("node-1", "c1", 0)));
        assert_eq!(cluster.len(), 3);
    }

    #[test]
    fn majority_tracks_alive_nodes() {
        let mut cluster = three_nodes();
        assert_eq!(cluster.majority(), 2);
        cluster.node_mut("node-3").unwrap().fail();
        assert_eq!(cluster.alive_count(), 2);
        assert_eq!(cluster.majority(), 2);
        cluster.node_mut("node-2").unwrap().fail();
        assert_eq!(cluster.majority(), 1);
    }

    #[test]
    fn command_leader_skips_partitioned_and_prefers_newer_term() {
        let mut cluster = three_nodes();
        {
            let old = cluster.node_mut("node-1").unwrap();
            old.current_term = 1;
            old.become_leader(0);
        }
        assert_eq!(cluster.command_leader().unwrap().node_id, "node-1");

        {
            let new = cluster.node_mut("node-2").unwrap();
            new.current_term = 2;
            new.become_leader(0);
        }
        assert_eq!(cluster.command_leader().unwrap().node_id, "node-2");

        cluster.node_mut("node-2").unwrap().toggle_partition();
        assert_eq!(cluster.command_leader().unwrap().node_id, "node-1");
    }

    #[test]
    fn commit_needs_majority_of_holders() {
        let mut cluster = three_nodes();
        let entry = {
            let leader = cluster.node_mut("node-1").unwrap();
            leader.current_term = 2;
            leader.become_leader(0);
            leader.append_command("SET x=1")
        };
        assert_eq!(cluster.advance_commit("node-1"), None);

        let follower = cluster.node_mut("node-2").unwrap();
        follower.receive_entries(None, 0, &[entry], None, Default::default());
        assert_eq!(cluster.advance_commit("node-1"), Some(0));

        for id in ["node-1", "node-2"] {
            let node = cluster.node(id).unwrap();
            assert_eq!(node.commit_index, Some(0));
            assert!(node.log.get(0).unwrap().committed);
            assert_eq!(node.kv.get("x"), Some("1"));
        }
        assert_eq!(cluster.node("node-3").unwrap().commit_index, None);
    }

    #[test]
    fn progress_walks_back_on_failure() {
        let peers = vec!["node-2".to_string()];
        let mut progress = LeaderProgress::new(&peers, 5);
        assert_eq!(progress.next_index("node-2"), 5);
        progress.record_failure("node-2", Some(3));
        assert_eq!(progress.next_index("node-2"), 4);
        progress.record_failure("node-2", None);
        assert_eq!(progress.next_index("node-2"), 0);
        progress.record_success("node-2", Some(2));
        assert_eq!(progress.next_index("node-2"), 3);
        assert_eq!(progress.match_index("node-2"), Some(2));
    }

    #[test]
    fn removing_a_node_forgets_it_everywhere() {
        let mut cluster = three_nodes();
        cluster.node_mut("node-1").unwrap().become_leader(0);
        cluster.reset_progress("node-1");
        cluster.remove("node-2");
        assert_eq!(cluster.peers_of("node-1"), vec!["node-3".to_string()]);
        assert_eq!(cluster.progress("node-1").unwrap().next_index("node-2"), 0);
    }
}
