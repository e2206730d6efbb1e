//! Error types shared by every guard.
use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside `RetriesExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Which guard produced a guard-generated failure.
///
/// Both bulkhead variants report `Bulkhead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardKind {
    CircuitBreaker,
    Bulkhead,
    RateLimiter,
    Retry,
    TimeLimiter,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GuardKind::CircuitBreaker => "circuit breaker",
            GuardKind::Bulkhead => "bulkhead",
            GuardKind::RateLimiter => "rate limiter",
            GuardKind::Retry => "retry",
            GuardKind::TimeLimiter => "time limiter",
        };
        f.write_str(label)
    }
}

/// Unified error type for all guards.
///
/// Every variant except `Inner` is guard-generated and carries the name of the guard
/// instance that produced it. `Retry` only ever retries `Inner` failures.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker refused the call (open, forced open, or probe budget spent).
    CallNotPermitted { name: String, state: CircuitState },
    /// A bulkhead had no free permit (or pool/queue slot) within its wait bound.
    BulkheadFull { name: String, max_concurrent_calls: usize },
    /// The rate limiter could not hand out a permit within its timeout.
    RequestNotPermitted { name: String, wait: Duration },
    /// The time limiter's bound elapsed before the unit of work completed.
    Timeout { name: String, elapsed: Duration, timeout: Duration },
    /// Retry gave up and was configured to report exhaustion instead of the last failure.
    RetriesExhausted { name: String, attempts: usize, failures: Arc<Vec<E>> },
    /// The unit of work itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallNotPermitted { name, state } => {
                write!(f, "circuit breaker '{}' is {} and does not permit further calls", name, state)
            }
            Self::BulkheadFull { name, max_concurrent_calls } => {
                write!(
                    f,
                    "bulkhead '{}' is full and does not permit further calls (max {})",
                    name, max_concurrent_calls
                )
            }
            Self::RequestNotPermitted { name, wait } => {
                write!(
                    f,
                    "rate limiter '{}' does not permit further calls (next permit in {:?})",
                    name, wait
                )
            }
            Self::Timeout { name, elapsed, timeout } => {
                write!(
                    f,
                    "time limiter '{}' timed out after {:?} (limit: {:?})",
                    name, elapsed, timeout
                )
            }
            Self::RetriesExhausted { name, attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry '{}' exhausted after {} attempts{}; last error: {}",
                        name, attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retry '{}' exhausted after {} attempts{}; no recorded failures",
                        name, attempts, truncated_note
                    ),
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetriesExhausted` variant keeping only the most recent
    /// `MAX_RETRY_FAILURES` failures.
    pub fn retries_exhausted(name: impl Into<String>, attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        ResilienceError::RetriesExhausted {
            name: name.into(),
            attempts,
            failures: Arc::new(trimmed),
        }
    }

    /// The guard that produced this failure, or `None` for application failures.
    pub fn guard_kind(&self) -> Option<GuardKind> {
        match self {
            Self::CallNotPermitted { .. } => Some(GuardKind::CircuitBreaker),
            Self::BulkheadFull { .. } => Some(GuardKind::Bulkhead),
            Self::RequestNotPermitted { .. } => Some(GuardKind::RateLimiter),
            Self::Timeout { .. } => Some(GuardKind::TimeLimiter),
            Self::RetriesExhausted { .. } => Some(GuardKind::Retry),
            Self::Inner(_) => None,
        }
    }

    /// Name of the guard instance that produced this failure.
    pub fn guard_name(&self) -> Option<&str> {
        match self {
            Self::CallNotPermitted { name, .. }
            | Self::BulkheadFull { name, .. }
            | Self::RequestNotPermitted { name, .. }
            | Self::Timeout { name, .. }
            | Self::RetriesExhausted { name, .. } => Some(name),
            Self::Inner(_) => None,
        }
    }

    /// True for every variant a guard generated itself.
    pub fn is_guard_generated(&self) -> bool {
        !self.is_inner()
    }

    pub fn is_call_not_permitted(&self) -> bool {
        matches!(self, Self::CallNotPermitted { .. })
    }

    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    pub fn is_request_not_permitted(&self) -> bool {
        matches!(self, Self::RequestNotPermitted { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Recorded failures for `RetriesExhausted`.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetriesExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// `(elapsed, timeout)` for a timeout.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout, .. } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Rejected guard configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must be within (0, 100] percent (got {value})")]
    InvalidPercentage { field: &'static str, value: f32 },
    #[error("{field} must be non-zero and finite (got {value:?})")]
    InvalidDuration { field: &'static str, value: Duration },
    #[error("{field} must not exceed {max} (got {value})")]
    TooLarge { field: &'static str, value: usize, max: usize },
    #[error("core_thread_pool_size ({core}) must not exceed max_thread_pool_size ({max})")]
    CoreExceedsMax { core: usize, max: usize },
    #[error("randomization factor must be within [0, 1) (got {0})")]
    InvalidRandomizationFactor(f64),
}

/// Failed registry lookup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("configuration '{0}' was never added to the registry")]
    ConfigurationNotFound(String),
}
