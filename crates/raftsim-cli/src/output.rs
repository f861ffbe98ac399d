//! # output
//!
//! why: turn engine events into terminal lines a person or a script can read
//! relations: fed by main.rs from raftsim-engine's broadcast channel
//! what: OutputFormat, EventPrinter (text or JSON lines), final node table

use std::io::{self, Write};

use clap::ValueEnum;
use raftsim_core::ClusterNode;
use raftsim_engine::{EngineEvent, PerformanceStats};
use tokio::sync::broadcast::{self, error::TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub struct EventPrinter<W: Write> {
    format: OutputFormat,
    show_messages: bool,
    out: W,
}

impl EventPrinter<io::Stdout> {
    pub fn stdout(format: OutputFormat, show_messages: bool) -> Self {
        Self::new(io::stdout(), format, show_messages)
    }
}

impl<W: Write> EventPrinter<W> {
    pub fn new(out: W, format: OutputFormat, show_messages: bool) -> Self {
        Self {
            format,
            show_messages,
            out,
        }
    }

    pub fn print(&mut self, event: &EngineEvent) -> io::Result<()> {
        if !self.show_messages && matches!(event, EngineEvent::MessageSent(_)) {
            return Ok(());
        }
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(event)?;
                writeln!(self.out, "{line}")
            }
            OutputFormat::Text => match describe(event) {
                Some(line) => writeln!(self.out, "{line}"),
                None => Ok(()),
            },
        }
    }

    /// Print whatever is buffered without waiting
    pub fn drain(&mut self, rx: &mut broadcast::Receiver<EngineEvent>) -> io::Result<()> {
        loop {
            match rx.try_recv() {
                Ok(event) => self.print(&event)?,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    pub fn summary(&mut self, stats: &PerformanceStats, nodes: &[ClusterNode]) -> io::Result<()> {
        if self.format == OutputFormat::Json {
            let summary = serde_json::json!({ "stats": stats, "nodes": nodes });
            return writeln!(self.out, "{summary}");
        }

        writeln!(
            self.out,
            "\n{} ms simulated, {} messages sent, {} events processed",
            stats.sim_time_ms, stats.messages_sent, stats.events_processed
        )?;
        writeln!(
            self.out,
            "{:<10} {:<10} {:>5} {:>5} {:>7} {:>5}  state",
            "node", "role", "term", "log", "commit", "keys"
        )?;
        for node in nodes {
            let commit = node
                .commit_index
                .map_or_else(|| "-".to_string(), |c| c.to_string());
            let state = match (node.is_alive, node.is_partitioned) {
                (false, _) => "down",
                (true, true) => "partitioned",
                (true, false) => "up",
            };
            writeln!(
                self.out,
                "{:<10} {:<10} {:>5} {:>5} {:>7} {:>5}  {}",
                node.node_id,
                node.role.to_string(),
                node.current_term,
                node.log.len(),
                commit,
                node.kv.len(),
                state
            )?;
        }
        Ok(())
    }
}

/// One human-readable line per event; full snapshots are left to json output
fn describe(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::NodesUpdated { .. } => return None,
        EngineEvent::MessageSent(m) => format!(
            "[{:>8}ms] {} {} -> {} (term {})",
            m.timestamp, m.kind, m.from, m.to, m.term
        ),
        EngineEvent::LeaderElected {
            cluster_id,
            leader_id,
            term,
        } => format!("{cluster_id}: {leader_id} elected leader for term {term}"),
        EngineEvent::NodeRegistered(node) => {
            format!("{}: {} registered", node.cluster_id, node.node_id)
        }
        EngineEvent::NodeRemoved {
            cluster_id,
            node_id,
        } => format!("{cluster_id}: {node_id} removed"),
        EngineEvent::ChaosStatus {
            cluster_id,
            running,
        } => {
            let state = if *running { "started" } else { "stopped" };
            format!("{cluster_id}: chaos {state}")
        }
        EngineEvent::PerformanceStats(s) => format!(
            "[{:>8}ms] {}/{} nodes alive, {} sent, {} in flight",
            s.sim_time_ms, s.alive_nodes, s.total_nodes, s.messages_sent, s.messages_in_flight
        ),
    };
    Some(line)
}
