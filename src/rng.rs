//! Seedable random number generator for deterministic testing.
//!
//! When a seed is provided via [`ConfigParams::rng_seed`](crate::ConfigParams), all
//! non-cryptographic randomness (the retransmission timeout randomization) will be
//! deterministic. Key material, randoms, cookies and session ids always come from the OS.

use rand::distributions::{Distribution, Standard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of the retransmission jitter, seeded per connection in tests.
pub struct SeededRng {
    inner: Option<StdRng>,
}

impl SeededRng {
    /// `None` draws from the thread-local generator.
    pub fn new(seed: Option<u64>) -> Self {
        let inner = seed.map(StdRng::seed_from_u64);
        Self { inner }
    }

    pub fn random<T>(&mut self) -> T
    where
        Standard: Distribution<T>,
    {
        match self.inner.as_mut() {
            Some(rng) => rng.gen(),
            None => rand::random(),
        }
    }

    /// A uniformly distributed factor in `[1.0, max]`.
    pub fn factor(&mut self, max: f64) -> f64 {
        if max <= 1.0 {
            return 1.0;
        }
        let r: f64 = self.random();
        1.0 + (max - 1.0) * r
    }
}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let is_seeded = self.inner.is_some();
        f.debug_struct("SeededRng")
            .field("seeded", &is_seeded)
            .finish()
    }
}
