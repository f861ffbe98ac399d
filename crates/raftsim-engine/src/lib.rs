//! # raftsim-engine
//!
//! why: run many simulated raft nodes on one shared timeline with injectable faults
//! relations: drives raftsim-core node state machines; consumed by raftsim-cli and any presentation layer
//! what: timers, message bus, cluster aggregate, election and replication protocols, chaos scheduler, events, runtime

pub mod bus;
pub mod chaos;
pub mod clock;
pub mod cluster;
pub mod config;
mod election;
pub mod engine;
pub mod error;
pub mod events;
mod replication;
pub mod rng;
pub mod runtime;
pub mod timer;

pub use chaos::{ChaosAction, ChaosScheduler};
pub use cluster::Cluster;
pub use config::{ChaosConfig, ChaosConfigPatch, SimConfig};
pub use engine::Simulation;
pub use error::{Result, SimError};
pub use events::{EngineEvent, PerformanceStats};
pub use runtime::EngineHandle;
