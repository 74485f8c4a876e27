//! Exponential backoff with seeded jitter.

use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Doubling delay between `min_ms` and `max_ms`, with ±`jitter_factor` applied per step.
#[derive(Debug)]
pub struct BackoffCalculator {
    min_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    attempt: u32,
    rng: ChaCha8Rng,
}

impl BackoffCalculator {
    pub fn new(min_ms: u64, max_ms: u64, jitter_factor: f64, seed: u64) -> Self {
        Self {
            min_ms,
            max_ms: max_ms.max(min_ms),
            multiplier: 2.0,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
            attempt: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Fixed schedule with no jitter.
    pub fn deterministic(min_ms: u64, max_ms: u64) -> Self {
        Self::new(min_ms, max_ms, 0.0, 0)
    }

    /// Compute next backoff duration with jitter
    pub fn next_backoff(&mut self) -> Duration {
        let base = (self.min_ms as f64) * self.multiplier.powi(self.attempt.min(32) as i32);
        let capped = base.min(self.max_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            self.rng.gen_range(-range..=range)
        } else {
            0.0
        };
        let final_ms = (capped + jitter).clamp(self.min_ms as f64, self.max_ms as f64);

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(final_ms as u64)
    }

    /// Reset on successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_to_cap() {
        let mut b = BackoffCalculator::deterministic(500, 3_000);
        let delays: Vec<u64> = (0..5).map(|_| b.next_backoff().as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 3_000, 3_000]);
        b.reset();
        assert_eq!(b.next_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds_and_is_seeded() {
        let mut a = BackoffCalculator::new(100, 10_000, 0.3, 42);
        let mut b = BackoffCalculator::new(100, 10_000, 0.3, 42);
        for _ in 0..20 {
            let da = a.next_backoff();
            assert_eq!(da, b.next_backoff());
            assert!(da >= Duration::from_millis(100));
            assert!(da <= Duration::from_millis(10_000));
        }
    }
}
