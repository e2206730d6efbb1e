//! Wait schedules between retry attempts.
//!
//! `delay(n)` is the wait before the `n`th retry, so `delay(1)` follows the first failure.
//! `delay(0)` is always zero. Results saturate at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use faultline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Ceiling applied to every computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
}

type DelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

#[derive(Clone)]
enum Schedule {
    Constant(Duration),
    Linear { base: Duration, max: Option<Duration> },
    Exponential { initial: Duration, multiplier: f64, max: Option<Duration> },
    Custom(DelayFn),
}

/// How long to wait before each retry.
#[derive(Clone)]
pub struct Backoff {
    schedule: Schedule,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schedule {
            Schedule::Constant(d) => f.debug_tuple("Constant").field(d).finish(),
            Schedule::Linear { base, max } => {
                f.debug_struct("Linear").field("base", base).field("max", max).finish()
            }
            Schedule::Exponential { initial, multiplier, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            Schedule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Backoff {
    /// Same wait before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay) }
    }

    /// `base * n` before the `n`th retry.
    pub fn linear(base: Duration) -> Self {
        Self { schedule: Schedule::Linear { base, max: None } }
    }

    /// Doubles every retry, starting at `initial`.
    pub fn exponential(initial: Duration) -> Self {
        Self { schedule: Schedule::Exponential { initial, multiplier: 2.0, max: None } }
    }

    /// `initial * multiplier^(n-1)` before the `n`th retry.
    pub fn exponential_with_multiplier(
        initial: Duration,
        multiplier: f64,
    ) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        Ok(Self { schedule: Schedule::Exponential { initial, multiplier, max: None } })
    }

    /// Arbitrary schedule; receives the retry number (starting at 1).
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self { schedule: Schedule::Custom(Arc::new(f)) }
    }

    /// Cap a growing schedule.
    pub fn with_max(self, max: Duration) -> Result<Self, BackoffError> {
        let schedule = match self.schedule {
            Schedule::Linear { base, .. } => {
                if max < base {
                    return Err(BackoffError::MaxLessThanBase { base, max });
                }
                Schedule::Linear { base, max: Some(max) }
            }
            Schedule::Exponential { initial, multiplier, .. } => {
                if max < initial {
                    return Err(BackoffError::MaxLessThanBase { base: initial, max });
                }
                Schedule::Exponential { initial, multiplier, max: Some(max) }
            }
            Schedule::Constant(_) | Schedule::Custom(_) => {
                return Err(BackoffError::ConstantDoesNotSupportMax)
            }
        };
        Ok(Self { schedule })
    }

    /// Wait before retry number `attempt`.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = match &self.schedule {
            Schedule::Constant(delay) => *delay,
            Schedule::Linear { base, max } => {
                let n = attempt.min(u32::MAX as usize) as u32;
                let linear = base.checked_mul(n).unwrap_or(MAX_BACKOFF);
                max.map_or(linear, |m| linear.min(m))
            }
            Schedule::Exponential { initial, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let nanos = (initial.as_nanos() as f64 * multiplier.powi(exponent)).round();
                let grown = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    MAX_BACKOFF
                };
                max.map_or(grown, |m| grown.min(m))
            }
            Schedule::Custom(f) => f(attempt),
        };
        delay.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::constant(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff() {
        let backoff = Backoff::constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(100));
    }

    #[test]
    fn linear_backoff_with_cap() {
        let backoff = Backoff::linear(Duration::from_millis(100))
            .with_max(Duration::from_millis(250))
            .unwrap();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_grows_and_saturates() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(1000), MAX_BACKOFF);
    }

    #[test]
    fn custom_multiplier() {
        let backoff =
            Backoff::exponential_with_multiplier(Duration::from_millis(100), 1.5).unwrap();
        assert_eq!(backoff.delay(3), Duration::from_millis(225));
        assert_eq!(
            Backoff::exponential_with_multiplier(Duration::from_millis(1), 0.5).unwrap_err(),
            BackoffError::InvalidMultiplier(0.5)
        );
    }

    #[test]
    fn custom_schedule() {
        let backoff = Backoff::custom(|n| Duration::from_secs(n as u64 * 10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        assert!(backoff.clone().with_max(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn max_must_not_be_below_base() {
        let err = Backoff::linear(Duration::from_secs(2)).with_max(Duration::from_secs(1)).unwrap_err();
        assert_eq!(
            err,
            BackoffError::MaxLessThanBase { base: Duration::from_secs(2), max: Duration::from_secs(1) }
        );
        assert!(Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(5)).is_err());
    }
}
