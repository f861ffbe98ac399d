//! # runtime
//!
//! why: drive a simulation against the wall clock while other tasks talk to it
//! relations: owns an engine.rs Simulation inside a tokio task; used by raftsim-cli live
//! what: spawn, Command loop with oneshot replies, Pacer, EngineHandle

use std::ops::RangeInclusive;

use raftsim_core::{ClusterId, ClusterNode, LogEntry, NetworkMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::config::{ChaosConfig, ChaosConfigPatch};
use crate::engine::Simulation;
use crate::error::{Result, SimError};
use crate::events::{EngineEvent, PerformanceStats};

const COMMAND_BUFFER: usize = 100;

/// Accepted simulated-ms-per-wall-ms ratios
pub const TIME_SCALE_RANGE: RangeInclusive<f64> = 0.001..=1_000_000.0;

/// How long the loop sleeps when nothing is scheduled
const IDLE_WAKE: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug)]
enum Command {
    RegisterNode {
        cluster_id: ClusterId,
        node_id: String,
        reply: Reply<Result<ClusterNode>>,
    },
    RemoveNode {
        node_id: String,
        reply: Reply<Result<ClusterNode>>,
    },
    StartElection {
        node_id: String,
        reply: Reply<Result<()>>,
    },
    AddLogEntry {
        cluster_id: ClusterId,
        command: String,
        reply: Reply<Result<LogEntry>>,
    },
    FailNode {
        node_id: String,
        reply: Reply<Result<()>>,
    },
    RestartNode {
        node_id: String,
        reply: Reply<Result<()>>,
    },
    TogglePartition {
        node_id: String,
        reply: Reply<Result<bool>>,
    },
    SetNetworkDelay {
        node_id: String,
        delay_ms: u64,
        reply: Reply<Result<()>>,
    },
    MajorityCount {
        cluster_id: ClusterId,
        reply: Reply<usize>,
    },
    StartChaos {
        cluster_id: ClusterId,
        reply: Reply<bool>,
    },
    StopChaos {
        cluster_id: ClusterId,
        reply: Reply<bool>,
    },
    UpdateChaosConfig {
        cluster_id: ClusterId,
        patch: ChaosConfigPatch,
        reply: Reply<Result<ChaosConfig>>,
    },
    GetChaosConfig {
        cluster_id: ClusterId,
        reply: Reply<ChaosConfig>,
    },
    Node {
        node_id: String,
        reply: Reply<Option<ClusterNode>>,
    },
    Nodes {
        cluster_id: ClusterId,
        reply: Reply<Vec<ClusterNode>>,
    },
    Leader {
        cluster_id: ClusterId,
        reply: Reply<Option<ClusterNode>>,
    },
    Messages {
        cluster_id: Option<ClusterId>,
        limit: usize,
        reply: Reply<Vec<NetworkMessage>>,
    },
    Stats {
        reply: Reply<PerformanceStats>,
    },
    NowMs {
        reply: Reply<u64>,
    },
    Clusters {
        reply: Reply<Vec<ClusterId>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a running engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<EngineEvent>,
}

/// Run `sim` on the current tokio runtime. `time_scale` is simulated
/// milliseconds per wall-clock millisecond. The join handle yields the
/// simulation back after shutdown.
pub fn spawn(sim: Simulation, time_scale: f64) -> Result<(EngineHandle, JoinHandle<Simulation>)> {
    if !TIME_SCALE_RANGE.contains(&time_scale) {
        return Err(SimError::InvalidConfig(format!(
            "time_scale must be within {}..={}, got {time_scale}",
            TIME_SCALE_RANGE.start(),
            TIME_SCALE_RANGE.end()
        )));
    }
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = EngineHandle {
        tx,
        events: sim.event_sender(),
    };
    let task = tokio::spawn(run(sim, rx, time_scale));
    Ok((handle, task))
}

/// Maps between simulated and wall-clock time
struct Pacer {
    wall_start: Instant,
    sim_start: u64,
    time_scale: f64,
}

impl Pacer {
    fn sim_now(&self) -> u64 {
        let elapsed_ms = self.wall_start.elapsed().as_secs_f64() * 1000.0;
        self.sim_start + (elapsed_ms * self.time_scale) as u64
    }

    /// Wall-clock instant for `sim_ms`. Deadlines too far out to represent
    /// fall back to an idle wake-up.
    fn wall_at(&self, sim_ms: u64) -> Instant {
        let sim_elapsed = sim_ms.saturating_sub(self.sim_start) as f64;
        Duration::try_from_secs_f64(sim_elapsed / self.time_scale / 1000.0)
            .ok()
            .and_then(|wait| self.wall_start.checked_add(wait))
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE)
    }
}

async fn run(mut sim: Simulation, mut rx: mpsc::Receiver<Command>, time_scale: f64) -> Simulation {
    let pacer = Pacer {
        wall_start: Instant::now(),
        sim_start: sim.now_ms(),
        time_scale,
    };
    tracing::info!(seed = sim.seed(), time_scale, "engine runtime started");

    loop {
        let next_due = sim.next_due_ms();
        let wake_at = next_due
            .map(|due| pacer.wall_at(due))
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE);

        tokio::select! {
            command = rx.recv() => {
                // commands see the timeline caught up to wall-clock now
                sim.advance_to(pacer.sim_now());
                match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => apply(&mut sim, command),
                    None => break,
                }
            }
            _ = sleep_until(wake_at) => {
                let target = pacer.sim_now().max(next_due.unwrap_or(0));
                sim.advance_to(target);
            }
        }
    }

    tracing::info!(sim_time_ms = sim.now_ms(), "engine runtime stopped");
    sim
}

fn apply(sim: &mut Simulation, command: Command) {
    // a dropped reply receiver only means the caller stopped waiting
    match command {
        Command::RegisterNode {
            cluster_id,
            node_id,
            reply,
        } => {
            let _ = reply.send(sim.register_node(&cluster_id, &node_id));
        }
        Command::RemoveNode { node_id, reply } => {
            let _ = reply.send(sim.remove_node(&node_id));
        }
        Command::StartElection { node_id, reply } => {
            let _ = reply.send(sim.start_election(&node_id));
        }
        Command::AddLogEntry {
            cluster_id,
            command,
            reply,
        } => {
            let _ = reply.send(sim.add_log_entry(&cluster_id, &command));
        }
        Command::FailNode { node_id, reply } => {
            let _ = reply.send(sim.fail_node(&node_id));
        }
        Command::RestartNode { node_id, reply } => {
            let _ = reply.send(sim.restart_node(&node_id));
        }
        Command::TogglePartition { node_id, reply } => {
            let _ = reply.send(sim.toggle_partition(&node_id));
        }
        Command::SetNetworkDelay {
            node_id,
            delay_ms,
            reply,
        } => {
            let _ = reply.send(sim.set_network_delay(&node_id, delay_ms));
        }
        Command::MajorityCount { cluster_id, reply } => {
            let _ = reply.send(sim.majority_count(&cluster_id));
        }
        Command::StartChaos { cluster_id, reply } => {
            let _ = reply.send(sim.start_chaos(&cluster_id));
        }
        Command::StopChaos { cluster_id, reply } => {
            let _ = reply.send(sim.stop_chaos(&cluster_id));
        }
        Command::UpdateChaosConfig {
            cluster_id,
            patch,
            reply,
        } => {
            let _ = reply.send(sim.update_chaos_config(&cluster_id, &patch));
        }
        Command::GetChaosConfig { cluster_id, reply } => {
            let _ = reply.send(sim.chaos_config(&cluster_id));
        }
        Command::Node { node_id, reply } => {
            let _ = reply.send(sim.node(&node_id).cloned());
        }
        Command::Nodes { cluster_id, reply } => {
            let _ = reply.send(sim.nodes(&cluster_id));
        }
        Command::Leader { cluster_id, reply } => {
            let _ = reply.send(sim.leader(&cluster_id).cloned());
        }
        Command::Messages {
            cluster_id,
            limit,
            reply,
        } => {
            let _ = reply.send(sim.messages(cluster_id.as_deref(), limit));
        }
        Command::Stats { reply } => {
            let _ = reply.send(sim.stats());
        }
        Command::NowMs { reply } => {
            let _ = reply.send(sim.now_ms());
        }
        Command::Clusters { reply } => {
            let _ = reply.send(sim.clusters());
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SimError::EngineStopped)?;
        rx.await.map_err(|_| SimError::EngineStopped)
    }

    pub async fn register_node(&self, cluster_id: &str, node_id: &str) -> Result<ClusterNode> {
        self.request(|reply| Command::RegisterNode {
            cluster_id: cluster_id.to_string(),
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn remove_node(&self, node_id: &str) -> Result<ClusterNode> {
        self.request(|reply| Command::RemoveNode {
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn start_election(&self, node_id: &str) -> Result<()> {
        self.request(|reply| Command::StartElection {
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn add_log_entry(&self, cluster_id: &str, command: &str) -> Result<LogEntry> {
        self.request(|reply| Command::AddLogEntry {
            cluster_id: cluster_id.to_string(),
            command: command.to_string(),
            reply,
        })
        .await?
    }

    pub async fn fail_node(&self, node_id: &str) -> Result<()> {
        self.request(|reply| Command::FailNode {
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn restart_node(&self, node_id: &str) -> Result<()> {
        self.request(|reply| Command::RestartNode {
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn toggle_partition(&self, node_id: &str) -> Result<bool> {
        self.request(|reply| Command::TogglePartition {
            node_id: node_id.to_string(),
            reply,
        })
        .await?
    }

    pub async fn set_network_delay(&self, node_id: &str, delay_ms: u64) -> Result<()> {
        self.request(|reply| Command::SetNetworkDelay {
            node_id: node_id.to_string(),
            delay_ms,
            reply,
        })
        .await?
    }

    pub async fn majority_count(&self, cluster_id: &str) -> Result<usize> {
        self.request(|reply| Command::MajorityCount {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn start_chaos(&self, cluster_id: &str) -> Result<bool> {
        self.request(|reply| Command::StartChaos {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn stop_chaos(&self, cluster_id: &str) -> Result<bool> {
        self.request(|reply| Command::StopChaos {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn update_chaos_config(
        &self,
        cluster_id: &str,
        patch: ChaosConfigPatch,
    ) -> Result<ChaosConfig> {
        self.request(|reply| Command::UpdateChaosConfig {
            cluster_id: cluster_id.to_string(),
            patch,
            reply,
        })
        .await?
    }

    pub async fn chaos_config(&self, cluster_id: &str) -> Result<ChaosConfig> {
        self.request(|reply| Command::GetChaosConfig {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn node(&self, node_id: &str) -> Result<Option<ClusterNode>> {
        self.request(|reply| Command::Node {
            node_id: node_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn nodes(&self, cluster_id: &str) -> Result<Vec<ClusterNode>> {
        self.request(|reply| Command::Nodes {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn leader(&self, cluster_id: &str) -> Result<Option<ClusterNode>> {
        self.request(|reply| Command::Leader {
            cluster_id: cluster_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn messages(
        &self,
        cluster_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<NetworkMessage>> {
        self.request(|reply| Command::Messages {
            cluster_id: cluster_id.map(str::to_string),
            limit,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> Result<PerformanceStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn now_ms(&self) -> Result<u64> {
        self.request(|reply| Command::NowMs { reply }).await
    }

    pub async fn clusters(&self) -> Result<Vec<ClusterId>> {
        self.request(|reply| Command::Clusters { reply }).await
    }

    /// Stop the engine task. Later commands fail with `EngineStopped`.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
