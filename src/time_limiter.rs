//! Time limiter bounding how long a unit of work may run.
//!
//! The operation races the timer. If the timer wins the caller receives
//! [`ResilienceError::Timeout`]; with `cancel_running_future` (the default) the operation is
//! dropped, otherwise it keeps running on the runtime and its result is discarded.

use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use std::fmt;
use std::future::Future;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// Validated configuration for a [`TimeLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeLimiterConfig {
    timeout_duration: Duration,
    cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self { timeout_duration: Duration::from_secs(1), cancel_running_future: true }
    }
}

impl TimeLimiterConfig {
    pub fn builder() -> TimeLimiterConfigBuilder {
        TimeLimiterConfigBuilder { config: Self::default() }
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout_duration
    }

    pub fn cancel_running_future(&self) -> bool {
        self.cancel_running_future
    }
}

#[derive(Debug, Clone)]
pub struct TimeLimiterConfigBuilder {
    config: TimeLimiterConfig,
}

impl TimeLimiterConfigBuilder {
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn cancel_running_future(mut self, cancel: bool) -> Self {
        self.config.cancel_running_future = cancel;
        self
    }

    pub fn build(self) -> Result<TimeLimiterConfig, ConfigError> {
        let timeout = self.config.timeout_duration;
        if timeout.is_zero() || timeout == Duration::MAX {
            return Err(ConfigError::InvalidDuration { field: "timeout_duration", value: timeout });
        }
        Ok(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimiterEvent {
    Success { elapsed: Duration },
    Error { elapsed: Duration },
    Timeout { elapsed: Duration },
}

impl fmt::Display for TimeLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { elapsed } => write!(f, "completed in {:?}", elapsed),
            Self::Error { elapsed } => write!(f, "failed after {:?}", elapsed),
            Self::Timeout { elapsed } => write!(f, "timed out after {:?}", elapsed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeLimiterMetrics {
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timed_out_calls: u64,
}

impl TimeLimiterMetrics {
    pub fn total_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls + self.timed_out_calls
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: TimeLimiterConfig,
    successful: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    events: EventPublisher<TimeLimiterEvent>,
}

/// Time limiter. Clones share metrics and listeners.
#[derive(Debug, Clone)]
pub struct TimeLimiter {
    inner: Arc<Shared>,
}

impl TimeLimiter {
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                config,
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        }
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, TimeLimiterConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<TimeLimiterEvent> {
        &self.inner.events
    }

    /// True when both handles refer to the same time limiter.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn metrics(&self) -> TimeLimiterMetrics {
        TimeLimiterMetrics {
            successful_calls: self.inner.successful.load(Ordering::Relaxed),
            failed_calls: self.inner.failed.load(Ordering::Relaxed),
            timed_out_calls: self.inner.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Executes the operation within `timeout_duration`.
    ///
    /// Without `cancel_running_future` the operation is spawned onto the current tokio runtime
    /// so that it can outlive the timeout.
    ///
    /// # Errors
    /// `ResilienceError::Timeout` if the operation did not complete in time, otherwise the
    /// operation's own result.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + Sync + 'static,
    {
        if self.inner.config.cancel_running_future {
            let start = Instant::now();
            let timeout = self.inner.config.timeout_duration;
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => self.completed(result, start.elapsed()),
                Err(_) => Err(self.timed_out(start.elapsed())),
            }
        } else {
            self.execute_handle(tokio::spawn(operation())).await
        }
    }

    /// Bound the wait on an already spawned task.
    ///
    /// On timeout the task is aborted when `cancel_running_future` is set, otherwise left
    /// running detached. A task panic resumes on the caller; a task aborted elsewhere is
    /// reported as a timeout.
    pub async fn execute_handle<T, E>(
        &self,
        mut handle: JoinHandle<Result<T, ResilienceError<E>>>,
    ) -> Result<T, ResilienceError<E>> {
        let start = Instant::now();
        let timeout = self.inner.config.timeout_duration;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => self.completed(result, start.elapsed()),
            Ok(Err(join_error)) => self.join_failed(join_error, start.elapsed()),
            Err(_) => {
                if self.inner.config.cancel_running_future {
                    handle.abort();
                }
                Err(self.timed_out(start.elapsed()))
            }
        }
    }

    fn completed<T, E>(
        &self,
        result: Result<T, ResilienceError<E>>,
        elapsed: Duration,
    ) -> Result<T, ResilienceError<E>> {
        match &result {
            Ok(_) => {
                self.inner.successful.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&TimeLimiterEvent::Success { elapsed });
            }
            Err(_) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&TimeLimiterEvent::Error { elapsed });
            }
        }
        result
    }

    fn join_failed<T, E>(
        &self,
        join_error: JoinError,
        elapsed: Duration,
    ) -> Result<T, ResilienceError<E>> {
        match join_error.try_into_panic() {
            Ok(payload) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.inner.events.publish(&TimeLimiterEvent::Error { elapsed });
                panic::resume_unwind(payload)
            }
            Err(_cancelled) => Err(self.timed_out(elapsed)),
        }
    }

    fn timed_out<E>(&self, elapsed: Duration) -> ResilienceError<E> {
        let timeout = self.inner.config.timeout_duration;
        self.inner.timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(limiter = %self.inner.name, ?elapsed, ?timeout, "Time limiter: timed out");
        self.inner.events.publish(&TimeLimiterEvent::Timeout { elapsed });
        ResilienceError::Timeout { name: self.inner.name.clone(), elapsed, timeout }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRecorder;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn limiter(timeout: Duration, cancel: bool) -> TimeLimiter {
        let config = TimeLimiterConfig::builder()
            .timeout_duration(timeout)
            .cancel_running_future(cancel)
            .build()
            .expect("valid config");
        TimeLimiter::new("slow-service", config)
    }

    #[test]
    fn defaults_and_validation() {
        let config = TimeLimiterConfig::default();
        assert_eq!(config.timeout_duration(), Duration::from_secs(1));
        assert!(config.cancel_running_future());
        assert!(TimeLimiterConfig::builder().timeout_duration(Duration::ZERO).build().is_err());
    }

    #[tokio::test]
    async fn completes_before_timeout() {
        let limiter = limiter(Duration::from_millis(100), true);
        let result = limiter
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(limiter.metrics().successful_calls, 1);
    }

    #[tokio::test]
    async fn failure_is_forwarded_unchanged() {
        let limiter = limiter(Duration::from_millis(100), true);
        let result = limiter
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("bad".into()))) })
            .await;
        assert_eq!(result.unwrap_err().into_inner(), Some(TestError("bad".into())));
        assert_eq!(limiter.metrics().failed_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_bound_and_cancels() {
        let limiter = limiter(Duration::from_secs(1), true);
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();

        let start = Instant::now();
        let err = limiter
            .execute(|| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                f.store(true, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
            .unwrap_err();

        let (elapsed, timeout) = err.timeout_details().expect("timeout");
        assert_eq!(timeout, Duration::from_secs(1));
        assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(limiter.metrics().timed_out_calls, 1);
        assert_eq!(limiter.metrics().total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_operation_keeps_running_without_cancel() {
        let limiter = limiter(Duration::from_secs(1), false);
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();

        let err = limiter
            .execute(|| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                f.store(true, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_spawned_handle_on_timeout() {
        let limiter = limiter(Duration::from_millis(50), true);
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            f.store(true, Ordering::SeqCst);
            Ok::<_, ResilienceError<TestError>>(())
        });

        assert!(limiter.execute_handle(handle).await.unwrap_err().is_timeout());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn publishes_events() {
        let limiter = limiter(Duration::from_millis(20), true);
        let recorder = EventRecorder::new();
        limiter.event_publisher().subscribe(recorder.listener());

        let _ = limiter.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        let _ = limiter
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;

        let events = recorder.events();
        assert!(matches!(events[0], TimeLimiterEvent::Success { .. }));
        assert!(matches!(events[1], TimeLimiterEvent::Timeout { .. }));
    }
}
