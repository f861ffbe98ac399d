//! # timer
//!
//! why: schedule timeouts, ticks and deliveries on one ordered timeline
//! relations: popped by engine.rs; election timeout bands come from config.rs
//! what: Timeline min-heap over (due, seq), TimerTable epochs, random_election_timeout
//!
//! Timers are never removed from the heap. Arming or cancelling bumps a
//! per-node epoch, and a fired event whose epoch is stale is a no-op.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use raftsim_core::{ClusterId, NetworkMessage, NodeId};

use crate::rng::DeterministicRng;

/// What a chaos recovery undoes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Restart,
    Heal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    ElectionTimeout { node_id: NodeId, epoch: u64 },
    HeartbeatTick { node_id: NodeId, epoch: u64 },
    Deliver { message: NetworkMessage },
    ChaosTick { cluster_id: ClusterId, epoch: u64 },
    ChaosRecovery { node_id: NodeId, recovery: Recovery },
    StatsTick,
}

#[derive(Debug)]
struct Scheduled {
    due_ms: u64,
    seq: u64,
    event: TimerEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // reversed: BinaryHeap is a max-heap, we want the earliest first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending events. Equal deadlines fire in scheduling order.
#[derive(Debug, Default)]
pub struct Timeline {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    pending_deliveries: usize,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due_ms: u64, event: TimerEvent) {
        if matches!(event, TimerEvent::Deliver { .. }) {
            self.pending_deliveries += 1;
        }
        self.heap.push(Scheduled {
            due_ms,
            seq: self.next_seq,
            event,
        });
        self.next_seq += 1;
    }

    pub fn next_due(&self) -> Option<u64> {
        self.heap.peek().map(|s| s.due_ms)
    }

    /// Pop the earliest event if it is due at or before `deadline_ms`
    pub fn pop_due(&mut self, deadline_ms: u64) -> Option<(u64, TimerEvent)> {
        if self.next_due()? > deadline_ms {
            return None;
        }
        let scheduled = self.heap.pop()?;
        if matches!(scheduled.event, TimerEvent::Deliver { .. }) {
            self.pending_deliveries -= 1;
        }
        Some((scheduled.due_ms, scheduled.event))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Messages sent but not yet delivered
    pub fn in_flight(&self) -> usize {
        self.pending_deliveries
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct NodeTimers {
    election_epoch: u64,
    election_due: Option<u64>,
    heartbeat_epoch: u64,
    heartbeat_armed: bool,
}

/// Current timer generations for every node
#[derive(Debug, Default)]
pub struct TimerTable {
    nodes: HashMap<NodeId, NodeTimers>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// New election generation due at `due_ms`; returns the epoch to schedule with
    pub fn arm_election(&mut self, node_id: &str, due_ms: u64) -> u64 {
        let timers = self.entry(node_id);
        timers.election_epoch += 1;
        timers.election_due = Some(due_ms);
        timers.election_epoch
    }

    pub fn cancel_election(&mut self, node_id: &str) {
        let timers = self.entry(node_id);
        timers.election_epoch += 1;
        timers.election_due = None;
    }

    pub fn is_current_election(&self, node_id: &str, epoch: u64) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|t| t.election_due.is_some() && t.election_epoch == epoch)
    }

    /// When the armed election timer will fire, if any
    pub fn election_deadline(&self, node_id: &str) -> Option<u64> {
        self.nodes.get(node_id).and_then(|t| t.election_due)
    }

    pub fn arm_heartbeat(&mut self, node_id: &str) -> u64 {
        let timers = self.entry(node_id);
        timers.heartbeat_epoch += 1;
        timers.heartbeat_armed = true;
        timers.heartbeat_epoch
    }

    pub fn cancel_heartbeat(&mut self, node_id: &str) {
        let timers = self.entry(node_id);
        timers.heartbeat_epoch += 1;
        timers.heartbeat_armed = false;
    }

    pub fn is_current_heartbeat(&self, node_id: &str, epoch: u64) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|t| t.heartbeat_armed && t.heartbeat_epoch == epoch)
    }

    /// Cancel both timers. Epochs are kept so a node re-registered under
    /// the same id never matches events scheduled for its previous life.
    pub fn cancel_all(&mut self, node_id: &str) {
        self.cancel_election(node_id);
        self.cancel_heartbeat(node_id);
    }

    fn entry(&mut self, node_id: &str) -> &mut NodeTimers {
        self.nodes.entry(node_id.to_string()).or_default()
    }
}

/// Draws a fresh election timeout from the configured band
pub fn random_election_timeout(rng: &mut DeterministicRng, min_ms: u64, max_ms: u64) -> u64 {
    rng.next_in_range(min_ms, max_ms)
}
