//! # events
//!
//! why: let presentation layers watch a run without touching the engine
//! relations: published by engine.rs and chaos.rs; consumed by raftsim-cli output.rs
//! what: EngineEvent, PerformanceStats, EventPublisher over a tokio broadcast channel
//!
//! A lagging subscriber loses the oldest events. Nobody gets a replay.

use raftsim_core::{ClusterId, ClusterNode, NetworkMessage, NodeId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Periodic engine-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub alive_nodes: usize,
    pub total_nodes: usize,
    pub clusters: usize,
    pub messages_sent: u64,
    pub messages_in_flight: usize,
    pub history_len: usize,
    pub sim_time_ms: u64,
    pub events_processed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// Full snapshot of a cluster after something in it changed
    #[serde(rename_all = "camelCase")]
    NodesUpdated {
        cluster_id: ClusterId,
        nodes: Vec<ClusterNode>,
    },
    MessageSent(NetworkMessage),
    #[serde(rename_all = "camelCase")]
    LeaderElected {
        cluster_id: ClusterId,
        leader_id: NodeId,
        term: u64,
    },
    NodeRegistered(ClusterNode),
    #[serde(rename_all = "camelCase")]
    NodeRemoved {
        cluster_id: ClusterId,
        node_id: NodeId,
    },
    #[serde(rename_all = "camelCase")]
    ChaosStatus { cluster_id: ClusterId, running: bool },
    PerformanceStats(PerformanceStats),
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<EngineEvent> {
        self.tx.clone()
    }

    pub fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}
