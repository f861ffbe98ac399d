//! # chaos
//!
//! why: inject faults on a schedule, reproducibly from the seed
//! relations: ticks are timeline events in timer.rs; faults go through the same engine.rs commands an operator uses
//! what: ChaosAction bands, ChaosScheduler epochs and configs, tick and recovery handlers
//!
//! Each tick draws once. Bands, in order: `failureRate`, then
//! `partitionProbability`, then a fixed delay-injection band.

use std::collections::HashMap;

use raftsim_core::{ClusterId, NodeId};

use crate::config::{ChaosConfig, ChaosConfigPatch};
use crate::engine::Simulation;
use crate::error::Result;
use crate::events::EngineEvent;
use crate::timer::{Recovery, TimerEvent};

/// Width of the delay-injection band above failure and partition
pub const DELAY_INJECTION_BAND: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosAction {
    FailNode,
    TogglePartition,
    InjectDelay,
}

/// Map one uniform draw in [0, 1) onto at most one action
pub fn choose_action(draw: f64, config: &ChaosConfig) -> Option<ChaosAction> {
    let fail_band = config.failure_rate;
    let partition_band = fail_band + config.partition_probability;
    let delay_band = partition_band + DELAY_INJECTION_BAND;

    if draw < fail_band {
        Some(ChaosAction::FailNode)
    } else if draw < partition_band {
        Some(ChaosAction::TogglePartition)
    } else if draw < delay_band {
        Some(ChaosAction::InjectDelay)
    } else {
        None
    }
}

/// Which clusters run chaos, and with what rates
#[derive(Debug)]
pub struct ChaosScheduler {
    /// Tick epoch per running cluster; a tick from an older epoch is stale
    running: HashMap<ClusterId, u64>,
    configs: HashMap<ClusterId, ChaosConfig>,
    default: ChaosConfig,
    next_epoch: u64,
}

impl ChaosScheduler {
    pub fn new(default: ChaosConfig) -> Self {
        Self {
            running: HashMap::new(),
            configs: HashMap::new(),
            default,
            next_epoch: 1,
        }
    }

    /// Mark the cluster running. Returns the tick epoch, or `None` if it already was.
    pub fn start(&mut self, cluster_id: &str) -> Option<u64> {
        if self.running.contains_key(cluster_id) {
            return None;
        }
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.running.insert(cluster_id.to_string(), epoch);
        Some(epoch)
    }

    /// Returns false if chaos was not running
    pub fn stop(&mut self, cluster_id: &str) -> bool {
        self.running.remove(cluster_id).is_some()
    }

    pub fn is_running(&self, cluster_id: &str) -> bool {
        self.running.contains_key(cluster_id)
    }

    pub fn is_current(&self, cluster_id: &str, epoch: u64) -> bool {
        self.running.get(cluster_id) == Some(&epoch)
    }

    /// The cluster's rates, falling back to the process-wide default
    pub fn config(&self, cluster_id: &str) -> ChaosConfig {
        self.configs
            .get(cluster_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn update_config(
        &mut self,
        cluster_id: &str,
        patch: &ChaosConfigPatch,
    ) -> Result<ChaosConfig> {
        let merged = patch.merge_into(&self.config(cluster_id));
        merged.validate()?;
        self.configs.insert(cluster_id.to_string(), merged.clone());
        Ok(merged)
    }
}

impl Simulation {
    /// Start the periodic chaos tick. Returns false if it was already running.
    pub fn start_chaos(&mut self, cluster_id: &str) -> bool {
        let Some(epoch) = self.chaos.start(cluster_id) else {
            tracing::warn!(cluster_id, "chaos already running");
            return false;
        };

        tracing::info!(cluster_id, "chaos started");
        let due = self.clock.now_ms() + self.config.chaos_interval_ms;
        self.timeline.schedule(
            due,
            TimerEvent::ChaosTick {
                cluster_id: cluster_id.to_string(),
                epoch,
            },
        );
        self.events.publish(EngineEvent::ChaosStatus {
            cluster_id: cluster_id.to_string(),
            running: true,
        });
        true
    }

    /// Stop the tick. Pending recoveries still run. Returns false if it was not running.
    pub fn stop_chaos(&mut self, cluster_id: &str) -> bool {
        if !self.chaos.stop(cluster_id) {
            tracing::debug!(cluster_id, "chaos not running");
            return false;
        }
        tracing::info!(cluster_id, "chaos stopped");
        self.events.publish(EngineEvent::ChaosStatus {
            cluster_id: cluster_id.to_string(),
            running: false,
        });
        true
    }

    pub fn is_chaos_running(&self, cluster_id: &str) -> bool {
        self.chaos.is_running(cluster_id)
    }

    pub fn chaos_config(&self, cluster_id: &str) -> ChaosConfig {
        self.chaos.config(cluster_id)
    }

    /// Shallow-merge new rates; they apply from the next tick
    pub fn update_chaos_config(
        &mut self,
        cluster_id: &str,
        patch: &ChaosConfigPatch,
    ) -> Result<ChaosConfig> {
        match self.chaos.update_config(cluster_id, patch) {
            Ok(config) => {
                tracing::info!(cluster_id, ?config, "chaos config updated");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(cluster_id, error = %e, "chaos config rejected");
                Err(e)
            }
        }
    }

    pub(crate) fn on_chaos_tick(&mut self, cluster_id: &str, epoch: u64) -> Result<()> {
        if !self.chaos.is_current(cluster_id, epoch) {
            return Ok(());
        }
        let now = self.clock.now_ms();
        self.timeline.schedule(
            now + self.config.chaos_interval_ms,
            TimerEvent::ChaosTick {
                cluster_id: cluster_id.to_string(),
                epoch,
            },
        );

        let config = self.chaos.config(cluster_id);
        let draw = self.chaos_rng.next_float();
        let Some(action) = choose_action(draw, &config) else {
            tracing::trace!(cluster_id, draw, "chaos tick, no action");
            return Ok(());
        };
        let Some(cluster) = self.clusters.get(cluster_id) else {
            return Ok(());
        };
        let alive: Vec<NodeId> = cluster
            .nodes()
            .filter(|n| n.is_alive)
            .map(|n| n.node_id.clone())
            .collect();
        let everyone: Vec<NodeId> = cluster.nodes().map(|n| n.node_id.clone()).collect();

        match action {
            ChaosAction::FailNode => {
                let Some(target) = self.chaos_rng.choose(&alive).cloned() else {
                    return Ok(());
                };
                tracing::info!(cluster_id, node_id = %target, "chaos: failing node");
                self.fail_node(&target)?;
                self.schedule_recovery(&target, Recovery::Restart, config.recovery_time);
            }
            ChaosAction::TogglePartition => {
                let Some(target) = self.chaos_rng.choose(&alive).cloned() else {
                    return Ok(());
                };
                tracing::info!(cluster_id, node_id = %target, "chaos: toggling partition");
                if self.toggle_partition(&target)? {
                    self.schedule_recovery(&target, Recovery::Heal, config.recovery_time);
                }
            }
            ChaosAction::InjectDelay => {
                let Some(target) = self.chaos_rng.choose(&everyone).cloned() else {
                    return Ok(());
                };
                let (min, max) = config.network_delay_range;
                let delay_ms = self.chaos_rng.next_in_range(min, max);
                tracing::info!(cluster_id, node_id = %target, delay_ms, "chaos: injecting delay");
                self.set_network_delay(&target, delay_ms)?;
            }
        }
        Ok(())
    }

    fn schedule_recovery(&mut self, node_id: &str, recovery: Recovery, after_ms: u64) {
        let due = self.clock.now_ms() + after_ms;
        self.timeline.schedule(
            due,
            TimerEvent::ChaosRecovery {
                node_id: node_id.to_string(),
                recovery,
            },
        );
    }

    /// Undo a chaos fault unless someone already did
    pub(crate) fn on_chaos_recovery(&mut self, node_id: &str, recovery: Recovery) -> Result<()> {
        let Some(node) = self.node(node_id) else {
            return Ok(());
        };
        match recovery {
            Recovery::Restart if !node.is_alive => {
                tracing::info!(node_id, "chaos recovery: restarting node");
                self.restart_node(node_id)
            }
            Recovery::Heal if node.is_partitioned => {
                tracing::info!(node_id, "chaos recovery: healing partition");
                self.toggle_partition(node_id).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_in_order() {
        let config = ChaosConfig {
            failure_rate: 0.1,
            partition_probability: 0.05,
            ..Default::default()
        };
        assert_eq!(choose_action(0.0, &config), Some(ChaosAction::FailNode));
        assert_eq!(choose_action(0.099, &config), Some(ChaosAction::FailNode));
        assert_eq!(choose_action(0.1, &config), Some(ChaosAction::TogglePartition));
        assert_eq!(choose_action(0.149, &config), Some(ChaosAction::TogglePartition));
        assert_eq!(choose_action(0.151, &config), Some(ChaosAction::InjectDelay));
        assert_eq!(choose_action(0.249, &config), Some(ChaosAction::InjectDelay));
        assert_eq!(choose_action(0.251, &config), None);
        assert_eq!(choose_action(0.99, &config), None);
    }

    #[test]
    fn zero_rates_leave_only_delay_band() {
        let config = ChaosConfig {
            failure_rate: 0.0,
            partition_probability: 0.0,
            ..Default::default()
        };
        assert_eq!(choose_action(0.0, &config), Some(ChaosAction::InjectDelay));
        assert_eq!(choose_action(DELAY_INJECTION_BAND, &config), None);
    }

    #[test]
    fn start_is_idempotent_and_stop_too() {
        let mut chaos = ChaosScheduler::new(ChaosConfig::default());
        let epoch = chaos.start("c1").unwrap();
        assert_eq!(chaos.start("c1"), None);
        assert!(chaos.is_current("c1", epoch));

        assert!(chaos.stop("c1"));
        assert!(!chaos.stop("c1"));
        assert!(!chaos.is_current("c1", epoch));

        let again = chaos.start("c1").unwrap();
        assert_ne!(again, epoch);
    }

    #[test]
    fn config_updates_merge_over_current() {
        let mut chaos = ChaosScheduler::new(ChaosConfig::default());
        chaos
            .update_config("c1", &ChaosConfigPatch::default().failure_rate(0.5))
            .unwrap();
        let merged = chaos
            .update_config("c1", &ChaosConfigPatch::default().recovery_time(10))
            .unwrap();
        assert_eq!(merged.failure_rate, 0.5);
        assert_eq!(merged.recovery_time, 10);
        assert_eq!(chaos.config("c2"), ChaosConfig::default());

        let bad = ChaosConfigPatch::default().partition_probability(2.0);
        assert!(chaos.update_config("c1", &bad).is_err());
        assert_eq!(chaos.config("c1").partition_probability, 0.05);
    }
}
