//! # bus
//!
//! why: give every message an id, a delay and a place in history
//! relations: engine.rs asks for the delay and schedules delivery on timer.rs's timeline itself
//! what: MessageBus: per-destination delays, id counter, bounded history ring buffer

use std::collections::{HashMap, VecDeque};

use raftsim_core::{NetworkMessage, NodeId};

#[derive(Debug)]
pub struct MessageBus {
    default_delay_ms: u64,
    delays: HashMap<NodeId, u64>,
    history: VecDeque<NetworkMessage>,
    history_limit: usize,
    next_id: u64,
    sent_total: u64,
}

impl MessageBus {
    pub fn new(default_delay_ms: u64, history_limit: usize) -> Self {
        Self {
            default_delay_ms,
            delays: HashMap::new(),
            history: VecDeque::with_capacity(history_limit.min(4096)),
            history_limit,
            next_id: 1,
            sent_total: 0,
        }
    }

    /// Delivery delay for messages addressed to `to`
    pub fn delay_for(&self, to: &str) -> u64 {
        self.delays.get(to).copied().unwrap_or(self.default_delay_ms)
    }

    pub fn set_delay(&mut self, node_id: &str, delay_ms: u64) {
        self.delays.insert(node_id.to_string(), delay_ms);
    }

    pub fn clear_delay(&mut self, node_id: &str) {
        self.delays.remove(node_id);
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Remember a sent message, evicting the oldest once the limit is hit
    pub fn record(&mut self, message: NetworkMessage) {
        self.sent_total += 1;
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(message);
    }

    /// The most recent `limit` messages, oldest first. `None` means every cluster.
    pub fn history(&self, cluster_id: Option<&str>, limit: usize) -> Vec<NetworkMessage> {
        let mut recent: Vec<NetworkMessage> = self
            .history
            .iter()
            .rev()
            .filter(|m| cluster_id.map_or(true, |c| m.cluster_id == c))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftsim_core::RaftMessage;

    fn message(bus: &mut MessageBus, cluster: &str) -> NetworkMessage {
        NetworkMessage::new(
            bus.next_id(),
            cluster,
            "node-1",
            "node-2",
            1,
            RaftMessage::VoteResponse { granted: true },
            0,
        )
    }

    #[test]
    fn delay_override_and_reset() {
        let mut bus = MessageBus::new(100, 10);
        assert_eq!(bus.delay_for("node-2"), 100);
        bus.set_delay("node-2", 750);
        assert_eq!(bus.delay_for("node-2"), 750);
        assert_eq!(bus.delay_for("node-3"), 100);
        bus.clear_delay("node-2");
        assert_eq!(bus.delay_for("node-2"), 100);
    }

    #[test]
    fn history_is_a_ring_buffer() {
        let mut bus = MessageBus::new(100, 3);
        for _ in 0..5 {
            let msg = message(&mut bus, "c1");
            bus.record(msg);
        }
        assert_eq!(bus.history_len(), 3);
        assert_eq!(bus.sent_total(), 5);
        let ids: Vec<u64> = bus.history(None, 10).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn history_filters_by_cluster_and_limit() {
        let mut bus = MessageBus::new(100, 10);
        for cluster in ["a", "b", "a", "a"] {
            let msg = message(&mut bus, cluster);
            bus.record(msg);
        }
        let ids: Vec<u64> = bus.history(Some("a"), 2).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(bus.history(Some("b"), 10).len(), 1);
    }
}
