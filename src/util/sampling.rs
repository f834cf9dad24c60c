//! Seeded sampling used by the callback (staleness) query.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bernoulli sampler over a shared, injectable random source.
///
/// With a fixed seed the sequence of draws is reproducible, which keeps the
/// callback sample stable in tests.
pub struct Sampler {
    rng: Mutex<StdRng>,
}

impl Sampler {
    /// Sampler with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Sampler seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Keep each item independently with probability `rate`.
    ///
    /// Rates outside `[0, 1]` are clamped; `0` keeps nothing and `1` keeps
    /// everything without consuming randomness.
    pub fn sample<I, T>(&self, items: I, rate: f64) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
    {
        let rate = rate.clamp(0.0, 1.0);
        if rate <= 0.0 {
            return Vec::new();
        }
        if rate >= 1.0 {
            return items.into_iter().collect();
        }
        let mut rng = self.rng.lock();
        items
            .into_iter()
            .filter(|_| rng.random_bool(rate))
            .collect()
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").finish_non_exhaustive()
    }
}
