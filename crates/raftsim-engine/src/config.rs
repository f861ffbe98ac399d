//! # config
//!
//! why: one validated place for every timing, bus and chaos knob
//! relations: read by engine.rs at construction and by chaos.rs per cluster; loaded from JSON by raftsim-cli
//! what: SimConfig, ChaosConfig, ChaosConfigPatch, validation

use std::path::Path;

use raftsim_core::LogMatching;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

/// Per-cluster fault injection rates.
///
/// All probabilities are independent per-tick draws, not cumulative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaosConfig {
    /// Probability that a tick fails a node
    pub failure_rate: f64,
    /// Probability (above `failure_rate`) that a tick toggles a partition
    pub partition_probability: f64,
    /// Inclusive band for injected per-node delays, in ms
    pub network_delay_range: (u64, u64),
    /// How long a chaos-failed or chaos-partitioned node stays that way, in ms
    pub recovery_time: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            partition_probability: 0.05,
            network_delay_range: (100, 1000),
            recovery_time: 5000,
        }
    }
}

impl ChaosConfig {
    pub fn validate(&self) -> Result<()> {
        check_probability("failureRate", self.failure_rate)?;
        check_probability("partitionProbability", self.partition_probability)?;
        let (min, max) = self.network_delay_range;
        if min > max {
            return Err(SimError::InvalidConfig(format!(
                "networkDelayRange min {min} exceeds max {max}"
            )));
        }
        Ok(())
    }
}

/// Partial chaos update, shallow-merged over the current config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaosConfigPatch {
    pub failure_rate: Option<f64>,
    pub partition_probability: Option<f64>,
    pub network_delay_range: Option<(u64, u64)>,
    pub recovery_time: Option<u64>,
}

impl ChaosConfigPatch {
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = Some(rate);
        self
    }

    pub fn partition_probability(mut self, probability: f64) -> Self {
        self.partition_probability = Some(probability);
        self
    }

    pub fn network_delay_range(mut self, min: u64, max: u64) -> Self {
        self.network_delay_range = Some((min, max));
        self
    }

    pub fn recovery_time(mut self, ms: u64) -> Self {
        self.recovery_time = Some(ms);
        self
    }

    pub fn merge_into(&self, base: &ChaosConfig) -> ChaosConfig {
        ChaosConfig {
            failure_rate: self.failure_rate.unwrap_or(base.failure_rate),
            partition_probability: self
                .partition_probability
                .unwrap_or(base.partition_probability),
            network_delay_range: self.network_delay_range.unwrap_or(base.network_delay_range),
            recovery_time: self.recovery_time.unwrap_or(base.recovery_time),
        }
    }
}

/// Engine configuration, read once at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Delivery delay for destinations without an override
    pub network_delay_ms: u64,
    /// Ring buffer size for message history
    pub message_history_limit: usize,
    pub stats_interval_ms: u64,
    pub chaos_interval_ms: u64,
    /// Cap on entries per catch-up append
    pub max_entries_per_append: usize,
    pub log_matching: LogMatching,
    /// Chance that a voter refuses a vote it would otherwise grant
    pub vote_refusal_rate: f64,
    /// Chance that a follower refuses an append it would otherwise accept
    pub append_rejection_rate: f64,
    /// Fixed seed for a reproducible run; drawn from entropy when unset
    pub seed: Option<u64>,
    /// Buffered events per subscriber before the slowest one lags
    pub event_capacity: usize,
    /// Default chaos rates for clusters without their own config
    pub chaos: ChaosConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1500,
            election_timeout_min_ms: 3000,
            election_timeout_max_ms: 5000,
            network_delay_ms: 100,
            message_history_limit: 1000,
            stats_interval_ms: 5000,
            chaos_interval_ms: 2000,
            max_entries_per_append: 64,
            log_matching: LogMatching::Strict,
            vote_refusal_rate: 0.0,
            append_rejection_rate: 0.0,
            seed: None,
            event_capacity: 1024,
            chaos: ChaosConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Default::default()
        }
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SimConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 || self.election_timeout_min_ms == 0 {
            return Err(SimError::InvalidConfig(
                "heartbeat interval and election timeout must be positive".into(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(SimError::InvalidConfig(format!(
                "election timeout min {} exceeds max {}",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.chaos_interval_ms == 0 || self.stats_interval_ms == 0 {
            return Err(SimError::InvalidConfig(
                "chaos and stats intervals must be positive".into(),
            ));
        }
        if self.event_capacity == 0 || self.max_entries_per_append == 0 {
            return Err(SimError::InvalidConfig(
                "event_capacity and max_entries_per_append must be positive".into(),
            ));
        }
        check_probability("vote_refusal_rate", self.vote_refusal_rate)?;
        check_probability("append_rejection_rate", self.append_rejection_rate)?;
        self.chaos.validate()
    }
}

fn check_probability(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SimError::InvalidConfig(format!(
            "{name} must be in [0, 1], got {value}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_classroom_timings() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.heartbeat_interval_ms, 1500);
        assert_eq!(cfg.election_timeout_min_ms, 3000);
        assert_eq!(cfg.election_timeout_max_ms, 5000);
        assert_eq!(cfg.network_delay_ms, 100);
        assert_eq!(cfg.chaos_interval_ms, 2000);
        assert_eq!(cfg.log_matching, LogMatching::Strict);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn chaos_defaults() {
        let cfg = ChaosConfig::default();
        assert_eq!(cfg.failure_rate, 0.1);
        assert_eq!(cfg.partition_probability, 0.05);
        assert_eq!(cfg.network_delay_range, (100, 1000));
        assert_eq!(cfg.recovery_time, 5000);
    }

    #[test]
    fn patch_merges_shallowly() {
        let base = ChaosConfig::default();
        let merged = ChaosConfigPatch::default()
            .failure_rate(0.5)
            .recovery_time(100)
            .merge_into(&base);
        assert_eq!(merged.failure_rate, 0.5);
        assert_eq!(merged.recovery_time, 100);
        assert_eq!(merged.partition_probability, base.partition_probability);
        assert_eq!(merged.network_delay_range, base.network_delay_range);
    }

    #[test]
    fn rejects_bad_values() {
        let cfg = SimConfig {
            election_timeout_min_ms: 10,
            election_timeout_max_ms: 5,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(SimError::InvalidConfig(_))));

        let cfg = SimConfig {
            vote_refusal_rate: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let chaos = ChaosConfig {
            network_delay_range: (900, 100),
            ..Default::default()
        };
        assert!(chaos.validate().is_err());
    }

    #[test]
    fn loads_partial_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"heartbeat_interval_ms": 50, "seed": 7, "log_matching": "lenient",
                "chaos": {{"failureRate": 0.3, "networkDelayRange": [5, 10]}}}}"#
        )
        .unwrap();

        let cfg = SimConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.heartbeat_interval_ms, 50);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.log_matching, LogMatching::Lenient);
        assert_eq!(cfg.chaos.failure_rate, 0.3);
        assert_eq!(cfg.chaos.network_delay_range, (5, 10));
        assert_eq!(cfg.chaos.recovery_time, 5000);
        assert_eq!(cfg.election_timeout_min_ms, 3000);
    }
}
