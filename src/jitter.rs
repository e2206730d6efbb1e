//! Randomization applied on top of a [`Backoff`](crate::Backoff) delay so that many callers
//! failing together do not retry in lockstep.
//!
//! - `None`: the delay as computed.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//! - `Randomized { factor }`: uniform in `[delay * (1 - factor), delay * (1 + factor)]`.

use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    #[default]
    None,
    Full,
    Equal,
    Randomized { factor: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Spread each delay by up to `factor` in both directions; `factor` must be in `[0, 1)`.
    pub fn randomized(factor: f64) -> Result<Self, ConfigError> {
        if !(0.0..1.0).contains(&factor) {
            return Err(ConfigError::InvalidRandomizationFactor(factor));
        }
        Ok(Jitter::Randomized { factor })
    }

    /// Randomize `delay` using the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Randomize `delay` with a caller-supplied RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        match *self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_nanos(rng.random_range(0..=nanos)),
            Jitter::Equal => Duration::from_nanos(rng.random_range(nanos / 2..=nanos)),
            Jitter::Randomized { factor } => {
                let spread = delay.as_secs_f64() * factor;
                let low = delay.as_secs_f64() - spread;
                let high = delay.as_secs_f64() + spread;
                if spread <= 0.0 {
                    return delay;
                }
                Duration::from_secs_f64(rng.random_range(low..=high))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_identity() {
        assert_eq!(Jitter::None.apply(Duration::from_millis(42)), Duration::from_millis(42));
    }

    #[test]
    fn full_and_equal_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(100);
        for _ in 0..200 {
            assert!(Jitter::Full.apply_with_rng(delay, &mut rng) <= delay);
            let equal = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(equal >= delay / 2 && equal <= delay);
        }
    }

    #[test]
    fn randomized_spreads_both_ways() {
        let jitter = Jitter::randomized(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let delay = Duration::from_millis(100);
        for _ in 0..200 {
            let d = jitter.apply_with_rng(delay, &mut rng);
            assert!(d >= Duration::from_millis(50) && d <= Duration::from_millis(150));
        }
        assert!(Jitter::randomized(1.0).is_err());
        assert!(Jitter::randomized(-0.1).is_err());
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
    }
}
