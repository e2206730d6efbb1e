//! Fixed-window rate limiter.
//!
//! Time is cut into cycles of `limit_refresh_period`. At the start of every cycle the available
//! permissions are refilled to `limit_for_period`; unused permissions never carry over. A caller
//! finding none left may *reserve* one from an upcoming cycle, as long as the wait until that
//! cycle fits in `timeout_duration`. Reservations can push the counter below zero, and
//! following refills pay that debt back first, so at most `limit_for_period` calls are admitted
//! per cycle.

use crate::adaptive::DynamicConfig;
use crate::clock::{duration_nanos, Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Validated configuration for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    limit_for_period: usize,
    limit_refresh_period: Duration,
    timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_millis(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder { config: Self::default() }
    }

    pub fn limit_for_period(&self) -> usize {
        self.limit_for_period
    }

    pub fn limit_refresh_period(&self) -> Duration {
        self.limit_refresh_period
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout_duration
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn limit_for_period(mut self, limit: usize) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        if self.config.limit_for_period == 0 {
            return Err(ConfigError::Zero { field: "limit_for_period" });
        }
        if self.config.limit_refresh_period < Duration::from_nanos(1) {
            return Err(ConfigError::InvalidDuration {
                field: "limit_refresh_period",
                value: self.config.limit_refresh_period,
            });
        }
        Ok(self.config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEvent {
    /// A permission was granted; `wait` is how long the caller had to wait for it.
    SuccessfulAcquire { wait: Duration },
    FailedAcquire,
    Drained,
}

impl fmt::Display for RateLimiterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SuccessfulAcquire { wait } => write!(f, "permission acquired after {:?}", wait),
            Self::FailedAcquire => f.write_str("permission denied"),
            Self::Drained => f.write_str("permissions drained"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Negative when callers have reserved permissions from upcoming cycles.
    pub available_permissions: i64,
    pub number_of_waiting_threads: usize,
    /// Calls that ran and succeeded.
    pub successful_calls: u64,
    /// Calls that ran and failed.
    pub failed_calls: u64,
    /// Calls refused a permission.
    pub rejected_calls: u64,
}

impl RateLimiterMetrics {
    pub fn total_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls + self.rejected_calls
    }
}

#[derive(Debug, Clone, Copy)]
struct CycleState {
    cycle: u64,
    permissions: i64,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: RateLimiterConfig,
    refresh_period_nanos: u64,
    limit_for_period: DynamicConfig<usize>,
    timeout: DynamicConfig<Duration>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<CycleState>,
    waiting: AtomicUsize,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    events: EventPublisher<RateLimiterEvent>,
}

/// Process-local rate limiter. Clones share the same permissions, clock and sleeper.
///
/// # Examples
/// ```
/// use faultline::{RateLimiter, RateLimiterConfig};
/// use std::time::Duration;
///
/// let config = RateLimiterConfig::builder()
///     .limit_for_period(10)
///     .limit_refresh_period(Duration::from_secs(1))
///     .timeout_duration(Duration::ZERO)
///     .build()
///     .unwrap();
/// let limiter = RateLimiter::new("search", config);
/// assert_eq!(limiter.reserve_permission(), Some(Duration::ZERO));
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self::from_parts(
            name.into(),
            config,
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
            EventPublisher::new(),
        )
    }

    fn from_parts(
        name: String,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        events: EventPublisher<RateLimiterEvent>,
    ) -> Self {
        let limit = config.limit_for_period;
        let now = clock.now_nanos();
        let refresh_period_nanos = duration_nanos(config.limit_refresh_period).max(1);
        Self {
            inner: Arc::new(Shared {
                name,
                refresh_period_nanos,
                limit_for_period: DynamicConfig::new(limit),
                timeout: DynamicConfig::new(config.timeout_duration),
                config,
                clock,
                sleeper,
                state: Mutex::new(CycleState {
                    cycle: now / refresh_period_nanos,
                    permissions: limit as i64,
                }),
                waiting: AtomicUsize::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RateLimiterConfig::default())
    }

    /// Rebuild the limiter measuring cycles with `clock`.
    ///
    /// The result starts a fresh permission cycle and keeps live limit, timeout and
    /// listeners. Handles cloned before this call stay on the old clock and cycle state.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.rebuild(Arc::new(clock), self.inner.sleeper.clone())
    }

    /// Rebuild the limiter performing reserved-permission waits with `sleeper`. Same sharing
    /// rules as [`with_clock`](Self::with_clock).
    pub fn with_sleeper<S: Sleeper + 'static>(self, sleeper: S) -> Self {
        self.rebuild(self.inner.clock.clone(), Arc::new(sleeper))
    }

    fn rebuild(&self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        let inner = &self.inner;
        let rebuilt = Self::from_parts(
            inner.name.clone(),
            inner.config.clone(),
            clock,
            sleeper,
            inner.events.clone(),
        );
        rebuilt.change_limit_for_period(inner.limit_for_period.load());
        rebuilt.change_timeout_duration(inner.timeout.load());
        rebuilt
    }

    /// True when both handles share one permission state.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration the limiter was created with; see [`limit_for_period`](Self::limit_for_period)
    /// and [`timeout_duration`](Self::timeout_duration) for the live values.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.inner.events
    }

    pub fn limit_for_period(&self) -> usize {
        self.inner.limit_for_period.load()
    }

    pub fn timeout_duration(&self) -> Duration {
        self.inner.timeout.load()
    }

    /// New limit, applied from the next refresh onwards.
    pub fn change_limit_for_period(&self, limit: usize) {
        self.inner.limit_for_period.set(limit.max(1));
    }

    /// New wait bound for callers arriving from now on.
    pub fn change_timeout_duration(&self, timeout: Duration) {
        self.inner.timeout.set(timeout);
    }

    /// Reserve one permission without waiting for it.
    ///
    /// Returns how long the caller must wait before using it (zero if available right away),
    /// or `None` if that wait would exceed the timeout and nothing was reserved.
    pub fn reserve_permission(&self) -> Option<Duration> {
        let timeout = duration_nanos(self.inner.timeout.load());
        let wait = {
            let mut state = self.inner.state.lock().expect("rate limiter poisoned");
            let now = self.inner.clock.now_nanos();
            self.refresh(&mut state, now);
            let wait = self.nanos_to_wait(&state, now);
            if wait > timeout {
                None
            } else {
                state.permissions -= 1;
                Some(Duration::from_nanos(wait))
            }
        };

        match wait {
            Some(wait) => self.inner.events.publish(&RateLimiterEvent::SuccessfulAcquire { wait }),
            None => {
                tracing::debug!(limiter = %self.inner.name, "Rate limiter: request not permitted");
                self.inner.events.publish(&RateLimiterEvent::FailedAcquire);
            }
        }
        wait
    }

    /// Obtain one permission, sleeping until its cycle if it had to be reserved.
    ///
    /// Returns `false` if no permission is available within the timeout.
    pub async fn acquire_permission(&self) -> bool {
        match self.reserve_permission() {
            Some(wait) => {
                self.wait_for(wait).await;
                true
            }
            None => false,
        }
    }

    /// Executes the operation once a permission was obtained.
    ///
    /// # Errors
    /// `ResilienceError::RequestNotPermitted` if no permission was available within
    /// `timeout_duration`; the operation is not run.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        match self.reserve_permission() {
            Some(wait) => {
                self.wait_for(wait).await;
                let result = operation().await;
                let counter = if result.is_ok() { &self.inner.successful } else { &self.inner.failed };
                counter.fetch_add(1, Ordering::Relaxed);
                result
            }
            None => {
                self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                Err(ResilienceError::RequestNotPermitted {
                    name: self.inner.name.clone(),
                    wait: self.time_to_next_permission(),
                })
            }
        }
    }

    /// Take away every permission left in the current cycle.
    pub fn drain_permissions(&self) {
        {
            let mut state = self.inner.state.lock().expect("rate limiter poisoned");
            self.refresh(&mut state, self.inner.clock.now_nanos());
            state.permissions = state.permissions.min(0);
        }
        self.inner.events.publish(&RateLimiterEvent::Drained);
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = *self.inner.state.lock().expect("rate limiter poisoned");
        self.refresh(&mut state, self.inner.clock.now_nanos());
        RateLimiterMetrics {
            available_permissions: state.permissions,
            number_of_waiting_threads: self.inner.waiting.load(Ordering::Relaxed),
            successful_calls: self.inner.successful.load(Ordering::Relaxed),
            failed_calls: self.inner.failed.load(Ordering::Relaxed),
            rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    async fn wait_for(&self, wait: Duration) {
        if wait.is_zero() {
            return;
        }

        struct Waiting<'a>(&'a AtomicUsize);
        impl Drop for Waiting<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.inner.waiting.fetch_add(1, Ordering::Relaxed);
        let _waiting = Waiting(&self.inner.waiting);
        self.inner.sleeper.sleep(wait).await;
    }

    fn time_to_next_permission(&self) -> Duration {
        let mut state = *self.inner.state.lock().expect("rate limiter poisoned");
        let now = self.inner.clock.now_nanos();
        self.refresh(&mut state, now);
        Duration::from_nanos(self.nanos_to_wait(&state, now))
    }

    /// Roll the state forward to the cycle containing `now`.
    fn refresh(&self, state: &mut CycleState, now: u64) {
        let current_cycle = now / self.inner.refresh_period_nanos;
        if current_cycle <= state.cycle {
            return;
        }
        let limit = self.inner.limit_for_period.load() as i64;
        let elapsed = (current_cycle - state.cycle).min(i64::MAX as u64) as i64;
        let refilled = state.permissions.saturating_add(elapsed.saturating_mul(limit));
        state.permissions = refilled.min(limit);
        state.cycle = current_cycle;
    }

    fn nanos_to_wait(&self, state: &CycleState, now: u64) -> u64 {
        if state.permissions >= 1 {
            return 0;
        }
        let period = self.inner.refresh_period_nanos;
        let limit = self.inner.limit_for_period.load() as i64;
        let to_next_cycle = (state.cycle + 1).saturating_mul(period).saturating_sub(now);
        let at_next_cycle = state.permissions + limit;
        let missing = 1 - at_next_cycle;
        let full_cycles = if missing <= 0 { 0 } else { (missing + limit - 1) / limit };
        (full_cycles as u64).saturating_mul(period).saturating_add(to_next_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventRecorder;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn limiter(limit: usize, period: Duration, timeout: Duration, clock: &ManualClock) -> RateLimiter {
        let config = RateLimiterConfig::builder()
            .limit_for_period(limit)
            .limit_refresh_period(period)
            .timeout_duration(timeout)
            .build()
            .expect("valid config");
        RateLimiter::new("api", config).with_clock(clock.clone()).with_sleeper(InstantSleeper)
    }

    #[test]
    fn defaults() {
        let config = RateLimiterConfig::default();
        assert_eq!(config.limit_for_period(), 50);
        assert_eq!(config.limit_refresh_period(), Duration::from_millis(500));
        assert_eq!(config.timeout_duration(), Duration::from_secs(5));
        assert!(RateLimiterConfig::builder().limit_for_period(0).build().is_err());
    }

    #[tokio::test]
    async fn admits_exactly_limit_per_period_without_waiting() {
        let clock = ManualClock::new();
        let limiter = limiter(5, Duration::from_secs(1), Duration::ZERO, &clock);

        let mut admitted = 0;
        let mut rejected = 0;
        for _ in 0..6 {
            match limiter.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await {
                Ok(()) => admitted += 1,
                Err(err) => {
                    assert!(err.is_request_not_permitted());
                    rejected += 1;
                }
            }
        }
        assert_eq!((admitted, rejected), (5, 1));
    }

    #[tokio::test]
    async fn rejection_reports_time_to_next_cycle() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::ZERO, &clock);
        assert!(limiter.acquire_permission().await);
        clock.advance(Duration::from_millis(300));

        let err = limiter
            .execute(|| async { Ok::<_, ResilienceError<TestError>>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::RequestNotPermitted { wait, .. } if wait == Duration::from_millis(700)));
    }

    #[tokio::test]
    async fn unused_permissions_do_not_accumulate() {
        let clock = ManualClock::new();
        let limiter = limiter(5, Duration::from_secs(1), Duration::ZERO, &clock);
        limiter.reserve_permission();
        limiter.reserve_permission();

        clock.advance(Duration::from_secs(3));
        assert_eq!(limiter.metrics().available_permissions, 5);
    }

    #[tokio::test]
    async fn reserves_from_next_cycles_within_timeout() {
        let clock = ManualClock::new();
        let sleeper = TrackingSleeper::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::from_secs(10), &clock)
            .with_sleeper(sleeper.clone());
        clock.advance(Duration::from_millis(250));

        for _ in 0..3 {
            assert!(limiter.acquire_permission().await);
        }
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(750), Duration::from_millis(1750)]
        );
        assert_eq!(limiter.metrics().available_permissions, -2);

        // debt is repaid before new permits show up
        clock.advance(Duration::from_millis(750));
        assert_eq!(limiter.metrics().available_permissions, -1);
        clock.advance(Duration::from_secs(2));
        assert_eq!(limiter.metrics().available_permissions, 1);
    }

    #[tokio::test]
    async fn wait_longer_than_timeout_is_rejected_without_reserving() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::from_millis(500), &clock);
        assert_eq!(limiter.reserve_permission(), Some(Duration::ZERO));
        assert_eq!(limiter.reserve_permission(), None);
        assert_eq!(limiter.metrics().available_permissions, 0);

        clock.advance(Duration::from_millis(600));
        assert_eq!(limiter.reserve_permission(), Some(Duration::from_millis(400)));
    }

    #[tokio::test]
    async fn drain_and_events() {
        let clock = ManualClock::new();
        let limiter = limiter(3, Duration::from_secs(1), Duration::ZERO, &clock);
        let recorder = EventRecorder::new();
        limiter.event_publisher().subscribe(recorder.listener());

        assert!(limiter.acquire_permission().await);
        limiter.drain_permissions();
        assert!(!limiter.acquire_permission().await);
        assert_eq!(limiter.metrics().available_permissions, 0);

        assert_eq!(
            recorder.events(),
            vec![
                RateLimiterEvent::SuccessfulAcquire { wait: Duration::ZERO },
                RateLimiterEvent::Drained,
                RateLimiterEvent::FailedAcquire,
            ]
        );
    }

    #[tokio::test]
    async fn changed_limit_applies_from_next_cycle() {
        let clock = ManualClock::new();
        let limiter = limiter(2, Duration::from_secs(1), Duration::ZERO, &clock);
        limiter.change_limit_for_period(4);
        assert_eq!(limiter.metrics().available_permissions, 2);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.metrics().available_permissions, 4);
        assert_eq!(limiter.limit_for_period(), 4);
        assert_eq!(limiter.config().limit_for_period(), 2);
    }

    #[tokio::test]
    async fn changed_timeout_allows_waiting() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::ZERO, &clock);
        assert!(limiter.acquire_permission().await);
        assert!(!limiter.acquire_permission().await);

        limiter.change_timeout_duration(Duration::from_secs(2));
        assert!(limiter.acquire_permission().await);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_waiting_callers() {
        let clock = ManualClock::new();
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(1))
            .timeout_duration(Duration::from_secs(5))
            .build()
            .unwrap();
        let limiter = RateLimiter::new("api", config).with_clock(clock.clone());
        assert!(limiter.acquire_permission().await);

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire_permission().await })
        };
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.metrics().number_of_waiting_threads, 1);

        assert!(waiter.await.unwrap());
        assert_eq!(limiter.metrics().number_of_waiting_threads, 0);
    }

    #[tokio::test]
    async fn counts_call_outcomes_and_rejections() {
        let clock = ManualClock::new();
        let limiter = limiter(3, Duration::from_secs(1), Duration::ZERO, &clock);

        limiter.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await.unwrap();
        limiter.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await.unwrap();
        let failed = limiter
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("boom".into()))) })
            .await;
        assert!(failed.unwrap_err().is_inner());
        let rejected =
            limiter.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await;
        assert!(rejected.unwrap_err().is_request_not_permitted());

        let metrics = limiter.metrics();
        assert_eq!(metrics.successful_calls, 2);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.rejected_calls, 1);
        assert_eq!(metrics.total_calls(), 4);
    }

    #[test]
    fn clones_share_clock_and_permissions() {
        let clock = ManualClock::new();
        let limiter = limiter(1, Duration::from_secs(1), Duration::ZERO, &clock);
        let clone = limiter.clone();
        assert!(clone.ptr_eq(&limiter));

        assert_eq!(limiter.reserve_permission(), Some(Duration::ZERO));
        assert_eq!(clone.reserve_permission(), None);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clone.reserve_permission(), Some(Duration::ZERO));
        assert_eq!(limiter.metrics().available_permissions, 0);
    }

    #[test]
    fn rebuilding_with_clock_keeps_live_settings() {
        let clock = ManualClock::new();
        let original = limiter(2, Duration::from_secs(1), Duration::ZERO, &clock);
        original.change_limit_for_period(5);

        let rebuilt = original.clone().with_clock(ManualClock::new());
        assert!(!rebuilt.ptr_eq(&original));
        assert_eq!(rebuilt.limit_for_period(), 5);
        assert_eq!(rebuilt.timeout_duration(), Duration::ZERO);
    }
}
