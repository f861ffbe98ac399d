//! # clock
//!
//! why: simulated time only moves forward, and only when the engine says so
//! relations: owned by engine.rs
//! what: SimClock

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimClock {
    now_ms: u64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Move to `ms`; earlier targets leave the clock where it is
    pub fn advance_to(&mut self, ms: u64) -> u64 {
        self.now_ms = self.now_ms.max(ms);
        self.now_ms
    }
}
