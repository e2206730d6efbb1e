//! Semaphore bulkhead limiting concurrent calls.
//!
//! Callers wait up to `max_wait_duration` for one of `max_concurrent_calls` permits. Waiters are
//! served in FIFO order (tokio's semaphore is fair). A zero wait never suspends. Dropping a
//! waiting future gives up its place in the queue.

use crate::adaptive::DynamicConfig;
use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Validated configuration for a [`Bulkhead`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    max_concurrent_calls: usize,
    max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent_calls: 25, max_wait_duration: Duration::ZERO }
    }
}

impl BulkheadConfig {
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder { config: Self::default() }
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }

    pub fn max_wait_duration(&self) -> Duration {
        self.max_wait_duration
    }
}

#[derive(Debug, Clone)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn max_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.max_concurrent_calls = calls;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    pub fn build(self) -> Result<BulkheadConfig, ConfigError> {
        if self.config.max_concurrent_calls == 0 {
            return Err(ConfigError::Zero { field: "max_concurrent_calls" });
        }
        if self.config.max_concurrent_calls > Semaphore::MAX_PERMITS {
            return Err(ConfigError::TooLarge {
                field: "max_concurrent_calls",
                value: self.config.max_concurrent_calls,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    CallPermitted,
    CallRejected,
    CallFinished,
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BulkheadEvent::CallPermitted => "call permitted",
            BulkheadEvent::CallRejected => "call rejected",
            BulkheadEvent::CallFinished => "call finished",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
    /// Calls that ran under a permit and succeeded.
    pub successful_calls: u64,
    /// Calls that ran under a permit and failed.
    pub failed_calls: u64,
    /// Callers refused a permit.
    pub rejected_calls: u64,
}

impl BulkheadMetrics {
    pub fn total_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls + self.rejected_calls
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    max_wait: DynamicConfig<Duration>,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    events: EventPublisher<BulkheadEvent>,
}

/// Concurrency-limiting guard. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    inner: Arc<Shared>,
}

/// A held bulkhead slot; released exactly once when dropped.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    events: EventPublisher<BulkheadEvent>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.events.publish(&BulkheadEvent::CallFinished);
    }
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_calls));
        let max_wait = DynamicConfig::new(config.max_wait_duration);
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                config,
                semaphore,
                max_wait,
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        }
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, BulkheadConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.inner.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        &self.inner.events
    }

    /// Change how long future callers wait for a permit. Callers already waiting keep their
    /// original bound.
    pub fn change_max_wait_duration(&self, wait: Duration) {
        self.inner.max_wait.set(wait);
    }

    pub fn max_wait_duration(&self) -> Duration {
        self.inner.max_wait.load()
    }

    /// Wait up to the configured bound for a permit.
    pub async fn try_acquire_permission(&self) -> Option<BulkheadPermit> {
        let wait = self.inner.max_wait.load();
        let semaphore = self.inner.semaphore.clone();
        let permit = if wait.is_zero() {
            semaphore.try_acquire_owned().ok()
        } else {
            match tokio::time::timeout(wait, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => Some(permit),
                _ => None,
            }
        };

        match permit {
            Some(permit) => {
                self.inner.events.publish(&BulkheadEvent::CallPermitted);
                Some(BulkheadPermit { _permit: permit, events: self.inner.events.clone() })
            }
            None => {
                tracing::debug!(
                    bulkhead = %self.inner.name,
                    max = self.inner.config.max_concurrent_calls,
                    "Bulkhead full"
                );
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&BulkheadEvent::CallRejected);
                None
            }
        }
    }

    /// Executes the operation while holding a permit.
    ///
    /// # Errors
    /// `ResilienceError::BulkheadFull` if no permit became free within `max_wait_duration`.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.try_acquire_permission().await.ok_or_else(|| {
            ResilienceError::BulkheadFull {
                name: self.inner.name.clone(),
                max_concurrent_calls: self.inner.config.max_concurrent_calls,
            }
        })?;
        let result = operation().await;
        drop(permit);
        let counter = if result.is_ok() { &self.inner.successful } else { &self.inner.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.inner.semaphore.available_permits(),
            max_allowed_concurrent_calls: self.inner.config.max_concurrent_calls,
            successful_calls: self.inner.successful.load(Ordering::Relaxed),
            failed_calls: self.inner.failed.load(Ordering::Relaxed),
            rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// True when both handles share one set of permits.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
