//! # rng
//!
//! why: every random decision must replay exactly from one seed
//! relations: forked by engine.rs into timer, chaos and protocol streams
//! what: DeterministicRng over ChaCha20: ranges, probabilities, choice, fork

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[derive(Debug, Clone)]
pub struct DeterministicRng {
    rng: ChaCha20Rng,
    seed: u64,
    fork_counter: u64,
}

impl DeterministicRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha20Rng::seed_from_u64(seed),
            seed,
            fork_counter: 0,
        }
    }

    /// Seed from OS entropy. Callers should log `seed()` so the run can be replayed.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform float in [0, 1)
    pub fn next_float(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Uniform integer in [min, max]; `min` when the band is inverted
    pub fn next_in_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    /// True with the given probability, clamped to [0, 1]
    pub fn next_bool(&mut self, probability: f64) -> bool {
        debug_assert!(
            (0.0..=1.0).contains(&probability),
            "probability must be in [0, 1], got {probability}"
        );
        self.next_float() < probability.clamp(0.0, 1.0)
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = self.rng.gen_range(0..items.len());
        items.get(index)
    }

    /// Independent stream derived from this one, so subsystems don't
    /// perturb each other's sequences.
    pub fn fork(&mut self) -> Self {
        // golden ratio constant spreads fork seeds apart
        let fork_seed = self.seed.wrapping_add(
            self.fork_counter
                .wrapping_add(1)
                .wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );
        self.fork_counter += 1;
        Self::new(fork_seed)
    }
}
