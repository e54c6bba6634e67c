//! Gilbert–Elliott loss simulation.
//!
//! Two-state Markov channel applied to inbound datagrams: from the good
//! state the channel enters the bad state with probability `p`; from the
//! bad state it recovers with probability `q`. Datagrams arriving while the
//! channel is bad are dropped. `p = 0, q = 1` is a transparent channel.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct GilbertLoss {
    p: f64,
    q: f64,
    bad: bool,
    rng: StdRng,
}

impl GilbertLoss {
    pub fn new(p: f64, q: f64) -> Self {
        Self::seeded(p, q, rand::random())
    }

    /// Deterministic channel for tests.
    pub fn seeded(p: f64, q: f64, seed: u64) -> Self {
        Self {
            p: p.clamp(0.0, 1.0),
            q: q.clamp(0.0, 1.0),
            bad: false,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A channel that never drops.
    pub fn off() -> Self {
        Self::seeded(0.0, 1.0, 0)
    }

    pub fn is_active(&self) -> bool {
        self.p > 0.0
    }

    /// Advance the channel by one datagram; true means drop it.
    pub fn should_drop(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.bad {
            if self.rng.gen::<f64>() < self.q {
                self.bad = false;
            }
        } else if self.rng.gen::<f64>() < self.p {
            self.bad = true;
        }
        self.bad
    }
}
