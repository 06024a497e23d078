//! Loss simulator
//!
//! Real networks drop packets, but loopback almost never does. To exercise
//! the client's retry engine the server can run every inbound datagram
//! through a [`DropPolicy`] before processing it. [`LossSimulator`] discards
//! each datagram independently with a fixed probability, using an injected
//! RNG so runs can be reproduced from a seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Loss simulator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LossError {
    #[error("Drop probability must be within [0.0, 1.0], got {0}")]
    OutOfRange(f64),

    #[error("Drop probability is not a number: {0:?}")]
    NotANumber(String),
}

/// Probability in `[0.0, 1.0]` that an inbound datagram is discarded
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct DropProbability(f64);

impl DropProbability {
    pub const NEVER: Self = Self(0.0);
    pub const ALWAYS: Self = Self(1.0);

    pub fn new(probability: f64) -> Result<Self, LossError> {
        if (0.0..=1.0).contains(&probability) {
            Ok(Self(probability))
        } else {
            Err(LossError::OutOfRange(probability))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for DropProbability {
    fn default() -> Self {
        Self(0.75)
    }
}

impl fmt::Display for DropProbability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DropProbability {
    type Err = LossError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let probability: f64 = s
            .trim()
            .parse()
            .map_err(|_| LossError::NotANumber(s.to_string()))?;
        Self::new(probability)
    }
}

/// Decide from one uniform draw in `[0, 1)` whether a datagram survives
pub fn should_process<R: Rng + ?Sized>(probability: DropProbability, rng: &mut R) -> bool {
    rng.gen::<f64>() >= probability.value()
}

/// Gate applied to every inbound message before it is processed
pub trait DropPolicy: Send {
    /// `false` discards the message without a reply
    fn should_process(&mut self) -> bool;
}

/// Policy that processes everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverDrop;

impl DropPolicy for NeverDrop {
    fn should_process(&mut self) -> bool {
        true
    }
}

/// Counters kept by [`LossSimulator`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LossStats {
    pub received: u64,
    pub dropped: u64,
}

impl LossStats {
    pub fn drop_ratio(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.dropped as f64 / self.received as f64
        }
    }
}

/// Drops each datagram independently with a fixed probability
#[derive(Debug)]
pub struct LossSimulator<R = StdRng> {
    probability: DropProbability,
    rng: R,
    stats: LossStats,
}

impl LossSimulator<StdRng> {
    /// Simulator seeded from OS entropy
    pub fn new(probability: DropProbability) -> Self {
        Self::with_rng(probability, StdRng::from_entropy())
    }

    /// Reproducible simulator
    pub fn seeded(probability: DropProbability, seed: u64) -> Self {
        Self::with_rng(probability, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> LossSimulator<R> {
    pub fn with_rng(probability: DropProbability, rng: R) -> Self {
        Self {
            probability,
            rng,
            stats: LossStats::default(),
        }
    }

    pub fn probability(&self) -> DropProbability {
        self.probability
    }

    pub fn stats(&self) -> LossStats {
        self.stats
    }
}

impl<R: Rng + Send> DropPolicy for LossSimulator<R> {
    fn should_process(&mut self) -> bool {
        let keep = should_process(self.probability, &mut self.rng);
        self.stats.received += 1;
        if !keep {
            self.stats.dropped += 1;
        }
        keep
    }
}
