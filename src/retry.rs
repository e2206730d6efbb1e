//! Retry for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only `ResilienceError::Inner(E)` values are eligible for retry; guard-generated errors
//!   return immediately.
//! - An `ignore` predicate match is passed straight through. If a `retry_on` predicate is set,
//!   only matching failures are retried; otherwise every failure is.
//! - The wait before retry `n` is `jitter.apply(backoff.delay(n))`, performed by the
//!   [`Sleeper`] (production uses `TokioSleeper`; tests inject `InstantSleeper` or
//!   `TrackingSleeper`).
//! - Once attempts are used up the last failure is returned as `Inner`, or as
//!   `RetriesExhausted` when `fail_after_max_attempts` is set.
//!
//! ```rust
//! use std::time::Duration;
//! use faultline::{Backoff, Jitter, ResilienceError, Retry, RetryConfig};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RetryConfig::<MyErr>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(1)))
//!     .jitter(Jitter::full())
//!     .build()
//!     .unwrap();
//! let retry = Retry::new("lookup", config);
//! let result: Result<(), ResilienceError<MyErr>> =
//!     retry.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.is_err());
//! assert_eq!(retry.metrics().failed_calls_with_retry, 1);
//! # });
//! ```

use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::{Backoff, Jitter};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Classifies an application failure.
pub type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Validated configuration for a [`Retry`].
pub struct RetryConfig<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Option<Predicate<E>>,
    ignore: Option<Predicate<E>>,
    fail_after_max_attempts: bool,
}

impl<E> Clone for RetryConfig<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            retry_on: self.retry_on.clone(),
            ignore: self.ignore.clone(),
            fail_after_max_attempts: self.fail_after_max_attempts,
        }
    }
}

impl<E> fmt::Debug for RetryConfig<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<predicate>"))
            .field("ignore", &self.ignore.as_ref().map(|_| "<predicate>"))
            .field("fail_after_max_attempts", &self.fail_after_max_attempts)
            .finish()
    }
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            retry_on: None,
            ignore: None,
            fail_after_max_attempts: false,
        }
    }
}

impl<E> RetryConfig<E> {
    pub fn builder() -> RetryConfigBuilder<E> {
        RetryConfigBuilder { config: Self::default() }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn fail_after_max_attempts(&self) -> bool {
        self.fail_after_max_attempts
    }

    /// Whether `error` would be retried (ignoring the attempt budget).
    pub fn is_retryable(&self, error: &E) -> bool {
        if self.ignore.as_ref().is_some_and(|ignore| ignore(error)) {
            return false;
        }
        self.retry_on.as_ref().map_or(true, |retry_on| retry_on(error))
    }

    fn is_ignored(&self, error: &E) -> bool {
        self.ignore.as_ref().is_some_and(|ignore| ignore(error))
    }
}

pub struct RetryConfigBuilder<E> {
    config: RetryConfig<E>,
}

impl<E> fmt::Debug for RetryConfigBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfigBuilder").field("config", &self.config).finish()
    }
}

impl<E> RetryConfigBuilder<E> {
    /// Total attempts including the first call.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Fixed wait between attempts; shorthand for `backoff(Backoff::constant(wait))`.
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.backoff = Backoff::constant(wait);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Retry only failures matching `predicate`.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Never retry failures matching `predicate`; takes precedence over `retry_on`.
    pub fn ignore<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.config.ignore = Some(Arc::new(predicate));
        self
    }

    /// Report exhaustion as `RetriesExhausted` instead of the last failure.
    pub fn fail_after_max_attempts(mut self, enabled: bool) -> Self {
        self.config.fail_after_max_attempts = enabled;
        self
    }

    pub fn build(self) -> Result<RetryConfig<E>, ConfigError> {
        if self.config.max_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_attempts" });
        }
        Ok(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// Attempt `attempt` failed and another follows after `wait`.
    Retry { attempt: usize, wait: Duration },
    /// The call succeeded after at least one retry.
    Success { attempts: usize },
    /// The call failed for good.
    Error { attempts: usize },
    /// The failure matched the ignore predicate and was passed through.
    IgnoredError,
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { attempt, wait } => {
                write!(f, "attempt {} failed, retrying in {:?}", attempt, wait)
            }
            Self::Success { attempts } => write!(f, "succeeded after {} attempts", attempts),
            Self::Error { attempts } => write!(f, "failed after {} attempts", attempts),
            Self::IgnoredError => f.write_str("ignored error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

impl RetryMetrics {
    pub fn successful_calls(&self) -> u64 {
        self.successful_calls_without_retry + self.successful_calls_with_retry
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls_without_retry + self.failed_calls_with_retry
    }

    pub fn total_calls(&self) -> u64 {
        self.successful_calls() + self.failed_calls()
    }
}

#[derive(Debug, Default)]
struct Counters {
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

impl Counters {
    fn success(&self, attempts: usize) {
        let counter =
            if attempts > 1 { &self.succeeded_with_retry } else { &self.succeeded_without_retry };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn failure(&self, attempts: usize) {
        let counter = if attempts > 1 { &self.failed_with_retry } else { &self.failed_without_retry };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared<E> {
    name: String,
    config: RetryConfig<E>,
    counters: Counters,
    events: EventPublisher<RetryEvent>,
}

/// Retry guard. Clones share metrics and listeners.
pub struct Retry<E> {
    inner: Arc<Shared<E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), sleeper: self.sleeper.clone() }
    }
}

impl<E> fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl<E> Retry<E> {
    pub fn new(name: impl Into<String>, config: RetryConfig<E>) -> Self {
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                config,
                counters: Counters::default(),
                events: EventPublisher::new(),
            }),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RetryConfig::default())
    }

    /// Override how waits between attempts are performed.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RetryConfig<E> {
        &self.inner.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<RetryEvent> {
        &self.inner.events
    }

    /// True when both handles share one set of counters and listeners.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: c.succeeded_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: c.succeeded_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: c.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: c.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Execute an async operation, re-invoking it on retryable failures.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let config = &self.inner.config;
        let counters = &self.inner.counters;
        let mut failures: VecDeque<E> = VecDeque::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    counters.success(attempt);
                    if attempt > 1 {
                        self.inner.events.publish(&RetryEvent::Success { attempts: attempt });
                    }
                    return Ok(value);
                }
                Err(ResilienceError::Inner(error)) => error,
                Err(other) => {
                    counters.failure(attempt);
                    self.inner.events.publish(&RetryEvent::Error { attempts: attempt });
                    return Err(other);
                }
            };

            if config.is_ignored(&error) {
                counters.failure(attempt);
                self.inner.events.publish(&RetryEvent::IgnoredError);
                return Err(ResilienceError::Inner(error));
            }
            if !config.is_retryable(&error) {
                counters.failure(attempt);
                self.inner.events.publish(&RetryEvent::Error { attempts: attempt });
                return Err(ResilienceError::Inner(error));
            }
            if attempt >= config.max_attempts {
                counters.failure(attempt);
                tracing::warn!(retry = %self.inner.name, attempts = attempt, "Retries exhausted");
                self.inner.events.publish(&RetryEvent::Error { attempts: attempt });
                if config.fail_after_max_attempts {
                    failures.push_back(error);
                    return Err(ResilienceError::retries_exhausted(
                        self.inner.name.clone(),
                        attempt,
                        failures.into(),
                    ));
                }
                return Err(ResilienceError::Inner(error));
            }
            if config.fail_after_max_attempts {
                failures.push_back(error);
                if failures.len() > crate::error::MAX_RETRY_FAILURES {
                    failures.pop_front();
                }
            }

            let wait = config.jitter.apply(config.backoff.delay(attempt));
            tracing::debug!(retry = %self.inner.name, attempt, ?wait, "Retrying after failure");
            self.inner.events.publish(&RetryEvent::Retry { attempt, wait });
            if !wait.is_zero() {
                self.sleeper.sleep(wait).await;
            }
        }
    }
}
