//! # error
//!
//! why: one error type for every engine operation
//! relations: returned by engine.rs commands and runtime.rs handles
//! what: SimError and Result alias

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    NodeExists(String),

    #[error("Node is down: {0}")]
    NodeDown(String),

    #[error("No live leader in cluster {0}")]
    NoLeader(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine has stopped")]
    EngineStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
