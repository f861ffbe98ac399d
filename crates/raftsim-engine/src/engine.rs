//! # engine
//!
//! why: one owner for every cluster, the timeline and the bus, so each event runs to completion alone
//! relations: dispatches into election.rs, replication.rs and chaos.rs; wrapped by runtime.rs for wall-clock use
//! what: Simulation: command API, read API, step/advance/run_until, send and deliver, timer arming
//!
//! Election, replication and chaos handlers live in their own modules as
//! further `impl Simulation` blocks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use raftsim_core::{
    majority, ClusterId, ClusterNode, LogPosition, NetworkMessage, NodeId, RaftMessage,
};
use tokio::sync::broadcast;

use crate::bus::MessageBus;
use crate::chaos::ChaosScheduler;
use crate::clock::SimClock;
use crate::cluster::Cluster;
use crate::config::SimConfig;
use crate::error::{Result, SimError};
use crate::events::{EngineEvent, EventPublisher, PerformanceStats};
use crate::replication::AppendRequest;
use crate::rng::DeterministicRng;
use crate::timer::{random_election_timeout, Timeline, TimerEvent, TimerTable};

#[derive(Debug)]
pub struct Simulation {
    pub(crate) config: SimConfig,
    pub(crate) clock: SimClock,
    pub(crate) timeline: Timeline,
    pub(crate) timers: TimerTable,
    pub(crate) clusters: BTreeMap<ClusterId, Cluster>,
    /// Which cluster each registered node lives in
    pub(crate) directory: HashMap<NodeId, ClusterId>,
    pub(crate) bus: MessageBus,
    pub(crate) chaos: ChaosScheduler,
    pub(crate) timer_rng: DeterministicRng,
    pub(crate) chaos_rng: DeterministicRng,
    pub(crate) protocol_rng: DeterministicRng,
    pub(crate) events: EventPublisher,
    seed: u64,
    dirty: BTreeSet<ClusterId>,
    events_processed: u64,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;

        let mut root = match config.seed {
            Some(seed) => DeterministicRng::new(seed),
            None => DeterministicRng::from_entropy(),
        };
        let seed = root.seed();
        tracing::info!(seed, "simulation seeded");

        let mut timeline = Timeline::new();
        timeline.schedule(config.stats_interval_ms, TimerEvent::StatsTick);

        Ok(Self {
            clock: SimClock::new(),
            timeline,
            timers: TimerTable::new(),
            clusters: BTreeMap::new(),
            directory: HashMap::new(),
            bus: MessageBus::new(config.network_delay_ms, config.message_history_limit),
            chaos: ChaosScheduler::new(config.chaos.clone()),
            timer_rng: root.fork(),
            chaos_rng: root.fork(),
            protocol_rng: root.fork(),
            events: EventPublisher::new(config.event_capacity),
            seed,
            dirty: BTreeSet::new(),
            events_processed: 0,
            config,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Seed that reproduces this run
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.sender()
    }

    // ---- command API -------------------------------------------------------

    /// Add a follower at term 0 and arm its first election timer
    pub fn register_node(&mut self, cluster_id: &str, node_id: &str) -> Result<ClusterNode> {
        if self.directory.contains_key(node_id) {
            return Err(SimError::NodeExists(node_id.to_string()));
        }

        let node = ClusterNode::new(node_id, cluster_id, self.clock.now_ms());
        let cluster = self
            .clusters
            .entry(cluster_id.to_string())
            .or_insert_with(Cluster::new);
        if !cluster.insert(node.clone()) {
            return Err(SimError::NodeExists(node_id.to_string()));
        }
        self.directory
            .insert(node_id.to_string(), cluster_id.to_string());

        tracing::info!(cluster_id, node_id, "node registered");
        self.arm_election(node_id);
        self.events.publish(EngineEvent::NodeRegistered(node.clone()));
        self.mark_dirty(cluster_id);
        self.flush();
        Ok(node)
    }

    /// Drop a node. Its timers go stale and deliveries to it become no-ops.
    pub fn remove_node(&mut self, node_id: &str) -> Result<ClusterNode> {
        let cluster_id = self.cluster_of(node_id)?;
        let cluster = self
            .clusters
            .get_mut(&cluster_id)
            .ok_or_else(|| SimError::NodeNotFound(node_id.to_string()))?;
        let node = cluster
            .remove(node_id)
            .ok_or_else(|| SimError::NodeNotFound(node_id.to_string()))?;
        let now_empty = cluster.is_empty();

        self.directory.remove(node_id);
        self.timers.cancel_all(node_id);
        self.bus.clear_delay(node_id);
        tracing::info!(cluster_id = %cluster_id, node_id, "node removed");
        self.events.publish(EngineEvent::NodeRemoved {
            cluster_id: cluster_id.clone(),
            node_id: node_id.to_string(),
        });

        if now_empty {
            self.clusters.remove(&cluster_id);
            self.stop_chaos(&cluster_id);
        } else {
            self.mark_dirty(&cluster_id);
        }
        self.flush();
        Ok(node)
    }

    /// Crash a node. Term and log survive; every timer it owns is cancelled.
    pub fn fail_node(&mut self, node_id: &str) -> Result<()> {
        let cluster_id = self.cluster_of(node_id)?;
        let node = self.node_entry(node_id)?;
        let was_leader = node.is_leader();
        node.fail();
        let term = node.current_term;

        tracing::info!(cluster_id = %cluster_id, node_id, term, was_leader, "node failed");
        self.timers.cancel_all(node_id);
        if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
            cluster.drop_progress(node_id);
        }
        self.mark_dirty(&cluster_id);
        self.flush();
        Ok(())
    }

    /// Bring a node back empty: term 0, no log, follower, fresh election timer
    pub fn restart_node(&mut self, node_id: &str) -> Result<()> {
        let cluster_id = self.cluster_of(node_id)?;
        let now = self.clock.now_ms();
        self.node_entry(node_id)?.restart(now);

        tracing::info!(cluster_id = %cluster_id, node_id, "node restarted");
        self.cancel_heartbeat(node_id);
        if let Some(cluster) = self.clusters.get_mut(&cluster_id) {
            cluster.drop_progress(node_id);
        }
        self.arm_election(node_id);
        self.mark_dirty(&cluster_id);
        self.flush();
        Ok(())
    }

    /// Flip the partition flag; returns whether the node is now partitioned
    pub fn toggle_partition(&mut self, node_id: &str) -> Result<bool> {
        let cluster_id = self.cluster_of(node_id)?;
        let partitioned = self.node_entry(node_id)?.toggle_partition();

        tracing::info!(cluster_id = %cluster_id, node_id, partitioned, "partition toggled");
        self.mark_dirty(&cluster_id);
        self.flush();
        Ok(partitioned)
    }

    /// Delivery delay for messages addressed to `node_id`
    pub fn set_network_delay(&mut self, node_id: &str, delay_ms: u64) -> Result<()> {
        self.cluster_of(node_id)?;
        tracing::info!(node_id, delay_ms, "network delay set");
        self.bus.set_delay(node_id, delay_ms);
        Ok(())
    }

    /// ⌊alive/2⌋+1 for the cluster; an unknown cluster has no live nodes
    pub fn majority_count(&self, cluster_id: &str) -> usize {
        self.clusters
            .get(cluster_id)
            .map_or_else(|| majority(0), Cluster::majority)
    }

    // ---- read API ----------------------------------------------------------

    pub fn node(&self, node_id: &str) -> Option<&ClusterNode> {
        let cluster_id = self.directory.get(node_id)?;
        self.clusters.get(cluster_id)?.node(node_id)
    }

    /// Snapshot of every node in the cluster, in id order
    pub fn nodes(&self, cluster_id: &str) -> Vec<ClusterNode> {
        self.clusters
            .get(cluster_id)
            .map(|c| c.nodes().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<&Cluster> {
        self.clusters.get(cluster_id)
    }

    pub fn clusters(&self) -> Vec<ClusterId> {
        self.clusters.keys().cloned().collect()
    }

    /// The live, reachable leader client commands go to
    pub fn leader(&self, cluster_id: &str) -> Option<&ClusterNode> {
        self.clusters.get(cluster_id)?.command_leader()
    }

    /// Most recent messages, oldest first; `None` covers every cluster
    pub fn messages(&self, cluster_id: Option<&str>, limit: usize) -> Vec<NetworkMessage> {
        self.bus.history(cluster_id, limit)
    }

    pub fn stats(&self) -> PerformanceStats {
        let all = || self.clusters.values().flat_map(|c| c.nodes());
        PerformanceStats {
            alive_nodes: all().filter(|n| n.is_alive).count(),
            total_nodes: all().count(),
            clusters: self.clusters.len(),
            messages_sent: self.bus.sent_total(),
            messages_in_flight: self.timeline.in_flight(),
            history_len: self.bus.history_len(),
            sim_time_ms: self.clock.now_ms(),
            events_processed: self.events_processed,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// When the node's armed election timer fires, if one is armed
    pub fn election_deadline(&self, node_id: &str) -> Option<u64> {
        self.timers.election_deadline(node_id)
    }

    pub fn next_due_ms(&self) -> Option<u64> {
        self.timeline.next_due()
    }

    // ---- driving the timeline ---------------------------------------------

    /// Fire the earliest pending event, advancing the clock to it.
    /// Returns the time it fired at.
    pub fn step(&mut self) -> Option<u64> {
        let (due, event) = self.timeline.pop_due(u64::MAX)?;
        self.clock.advance_to(due);
        self.dispatch(event);
        self.flush();
        Some(due)
    }

    pub fn advance(&mut self, ms: u64) {
        let target = self.clock.now_ms().saturating_add(ms);
        self.advance_to(target);
    }

    /// Fire everything due up to `target_ms`, then park the clock there
    pub fn advance_to(&mut self, target_ms: u64) {
        while let Some((due, event)) = self.timeline.pop_due(target_ms) {
            self.clock.advance_to(due);
            self.dispatch(event);
            self.flush();
        }
        self.clock.advance_to(target_ms);
    }

    /// Step until `done` holds or the clock would pass `limit_ms`.
    /// Returns whether `done` was reached.
    pub fn run_until(&mut self, limit_ms: u64, mut done: impl FnMut(&Simulation) -> bool) -> bool {
        loop {
            if done(self) {
                return true;
            }
            match self.timeline.next_due() {
                Some(due) if due <= limit_ms => {
                    self.step();
                }
                _ => {
                    self.clock.advance_to(limit_ms);
                    return done(self);
                }
            }
        }
    }

    fn dispatch(&mut self, event: TimerEvent) {
        self.events_processed += 1;
        let result = match event {
            TimerEvent::ElectionTimeout { node_id, epoch } => {
                self.on_election_timeout(&node_id, epoch)
            }
            TimerEvent::HeartbeatTick { node_id, epoch } => self.on_heartbeat_tick(&node_id, epoch),
            TimerEvent::Deliver { message } => self.on_deliver(message),
            TimerEvent::ChaosTick { cluster_id, epoch } => self.on_chaos_tick(&cluster_id, epoch),
            TimerEvent::ChaosRecovery { node_id, recovery } => {
                self.on_chaos_recovery(&node_id, recovery)
            }
            TimerEvent::StatsTick => {
                self.on_stats_tick();
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "dropping timeline event");
        }
    }

    fn on_stats_tick(&mut self) {
        let stats = self.stats();
        tracing::debug!(
            alive = stats.alive_nodes,
            total = stats.total_nodes,
            in_flight = stats.messages_in_flight,
            "performance stats"
        );
        self.events.publish(EngineEvent::PerformanceStats(stats));
        let due = self.clock.now_ms() + self.config.stats_interval_ms;
        self.timeline.schedule(due, TimerEvent::StatsTick);
    }

    // ---- message bus -------------------------------------------------------

    /// Send a protocol message. Nothing leaves a dead or partitioned sender,
    /// and nothing is addressed to a dead or partitioned destination.
    pub(crate) fn send(&mut self, from: &str, to: &str, term: u64, data: RaftMessage) -> bool {
        let Some(cluster_id) = self.directory.get(from).cloned() else {
            return false;
        };
        let Some(cluster) = self.clusters.get(&cluster_id) else {
            return false;
        };
        let reachable = |id: &str| cluster.node(id).is_some_and(|n| n.can_communicate());
        if !reachable(from) || !reachable(to) {
            tracing::trace!(from, to, kind = %data.kind(), "not sent, endpoint unreachable");
            return false;
        }

        let now = self.clock.now_ms();
        let message = NetworkMessage::new(self.bus.next_id(), cluster_id, from, to, term, data, now);
        let due = now + self.bus.delay_for(to);
        tracing::debug!(from, to, kind = %message.kind, term, due, "message sent");

        self.bus.record(message.clone());
        self.events.publish(EngineEvent::MessageSent(message.clone()));
        self.timeline.schedule(due, TimerEvent::Deliver { message });
        true
    }

    /// Deliveries are judged against the destination as it is now
    fn on_deliver(&mut self, message: NetworkMessage) -> Result<()> {
        let deliverable = self
            .node(&message.to)
            .is_some_and(|n| n.cluster_id == message.cluster_id && n.can_communicate());
        if !deliverable {
            tracing::debug!(
                id = message.id,
                to = %message.to,
                kind = %message.kind,
                "delivery dropped, destination unreachable"
            );
            return Ok(());
        }
        // in-flight traffic dies with a sender that crashed or got cut off
        let sender_reachable = self
            .node(&message.from)
            .is_some_and(|n| n.cluster_id == message.cluster_id && n.can_communicate());
        if !sender_reachable {
            tracing::debug!(
                id = message.id,
                from = %message.from,
                kind = %message.kind,
                "delivery dropped, sender unreachable"
            );
            return Ok(());
        }

        let NetworkMessage {
            from,
            to,
            term,
            data,
            cluster_id,
            ..
        } = message;
        match data {
            RaftMessage::VoteRequest {
                last_log_index,
                last_log_term,
            } => self.on_vote_request(
                &cluster_id,
                &to,
                &from,
                term,
                LogPosition::new(last_log_index, last_log_term),
            ),
            RaftMessage::VoteResponse { granted } => {
                self.on_vote_response(&cluster_id, &to, term, granted)
            }
            RaftMessage::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append(
                &cluster_id,
                &to,
                &from,
                term,
                AppendRequest {
                    prev_log_index,
                    prev_log_term,
                    entries: &entries,
                    leader_commit,
                },
            ),
            RaftMessage::Heartbeat {
                prev_log_index,
                prev_log_term,
                leader_commit,
            } => self.on_append(
                &cluster_id,
                &to,
                &from,
                term,
                AppendRequest {
                    prev_log_index,
                    prev_log_term,
                    entries: &[],
                    leader_commit,
                },
            ),
            RaftMessage::AppendEntriesResponse {
                success,
                match_index,
            } => self.on_append_response(&cluster_id, &to, &from, term, success, match_index),
        }
    }

    // ---- timers --------------------------------------------------------------

    pub(crate) fn arm_election(&mut self, node_id: &str) {
        let timeout = random_election_timeout(
            &mut self.timer_rng,
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        let due = self.clock.now_ms() + timeout;
        let epoch = self.timers.arm_election(node_id, due);
        self.timeline.schedule(
            due,
            TimerEvent::ElectionTimeout {
                node_id: node_id.to_string(),
                epoch,
            },
        );
    }

    pub(crate) fn cancel_election(&mut self, node_id: &str) {
        self.timers.cancel_election(node_id);
    }

    pub(crate) fn arm_heartbeat(&mut self, node_id: &str) {
        let due = self.clock.now_ms() + self.config.heartbeat_interval_ms;
        let epoch = self.timers.arm_heartbeat(node_id);
        self.timeline.schedule(
            due,
            TimerEvent::HeartbeatTick {
                node_id: node_id.to_string(),
                epoch,
            },
        );
    }

    pub(crate) fn cancel_heartbeat(&mut self, node_id: &str) {
        self.timers.cancel_heartbeat(node_id);
    }

    // ---- shared protocol helpers --------------------------------------------

    /// Adopt a newer term seen on the wire. A leader that steps down stops
    /// heartbeating and falls back on an election timer.
    pub(crate) fn adopt_term(&mut self, cluster_id: &str, node_id: &str, term: u64) -> bool {
        let Some(node) = self
            .clusters
            .get_mut(cluster_id)
            .and_then(|c| c.node_mut(node_id))
        else {
            return false;
        };
        let was_leader = node.is_leader();
        if !node.observe_term(term) {
            return false;
        }

        tracing::info!(cluster_id, node_id, term, "newer term observed, stepping down");
        if was_leader {
            self.demote_leader(cluster_id, node_id);
        }
        self.mark_dirty(cluster_id);
        true
    }

    /// Timer and progress cleanup for a node that just stopped leading
    pub(crate) fn demote_leader(&mut self, cluster_id: &str, node_id: &str) {
        self.cancel_heartbeat(node_id);
        if let Some(cluster) = self.clusters.get_mut(cluster_id) {
            cluster.drop_progress(node_id);
        }
        self.arm_election(node_id);
    }

    pub(crate) fn cluster_of(&self, node_id: &str) -> Result<ClusterId> {
        self.directory
            .get(node_id)
            .cloned()
            .ok_or_else(|| SimError::NodeNotFound(node_id.to_string()))
    }

    fn node_entry(&mut self, node_id: &str) -> Result<&mut ClusterNode> {
        let cluster_id = self.cluster_of(node_id)?;
        self.clusters
            .get_mut(&cluster_id)
            .and_then(|c| c.node_mut(node_id))
            .ok_or_else(|| SimError::NodeNotFound(node_id.to_string()))
    }

    pub(crate) fn mark_dirty(&mut self, cluster_id: &str) {
        self.dirty.insert(cluster_id.to_string());
    }

    /// Publish one `nodes-updated` per cluster touched since the last flush
    pub(crate) fn flush(&mut self) {
        for cluster_id in std::mem::take(&mut self.dirty) {
            if let Some(cluster) = self.clusters.get(&cluster_id) {
                self.events.publish(EngineEvent::NodesUpdated {
                    nodes: cluster.nodes().cloned().collect(),
                    cluster_id,
                });
            }
        }
    }
}
