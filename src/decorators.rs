//! Composition of several guards around one unit of work.
//!
//! Guards are kept as an ordered list and folded over the operation when
//! [`Decorators::decorate`] is called: the guard added first wraps the operation directly, the
//! guard added last is the outermost wrapper. The outermost guard is consulted first for
//! admission and records its outcome last.
//!
//! ```rust
//! use faultline::{Bulkhead, CircuitBreaker, Decorators, Retry};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let breaker = CircuitBreaker::of_defaults("backend");
//! let bulkhead = Bulkhead::of_defaults("backend");
//! let retry = Retry::of_defaults("backend");
//!
//! // Retry(CircuitBreaker(Bulkhead(operation)))
//! let call = Decorators::of(|| async { Ok::<_, std::io::Error>("pong") })
//!     .with_bulkhead(&bulkhead)
//!     .with_circuit_breaker(&breaker)
//!     .with_retry(&retry)
//!     .decorate();
//! assert_eq!(call.call().await.unwrap(), "pong");
//! # });
//! ```

use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::rate_limiter::RateLimiter;
use crate::retry::Retry;
use crate::thread_pool_bulkhead::ThreadPoolBulkhead;
use crate::time_limiter::TimeLimiter;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A repeatable unit of work, already lifted into guard errors.
pub type Operation<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Send + Sync>;

/// A guard that can wrap an [`Operation`] into another operation.
pub trait Decorate<T, E>: Send + Sync {
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E>;
}

impl<T, E> Decorate<T, E> for CircuitBreaker
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let breaker = self.clone();
        Arc::new(move || {
            let breaker = breaker.clone();
            let operation = operation.clone();
            async move { breaker.execute(|| operation()).await }.boxed()
        })
    }
}

impl<T, E> Decorate<T, E> for Bulkhead
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let bulkhead = self.clone();
        Arc::new(move || {
            let bulkhead = bulkhead.clone();
            let operation = operation.clone();
            async move { bulkhead.execute(|| operation()).await }.boxed()
        })
    }
}

impl<T, E> Decorate<T, E> for ThreadPoolBulkhead
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let pool = self.clone();
        Arc::new(move || {
            let pool = pool.clone();
            let operation = operation.clone();
            async move { pool.execute(move || operation()).await }.boxed()
        })
    }
}

impl<T, E> Decorate<T, E> for RateLimiter
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let limiter = self.clone();
        Arc::new(move || {
            let limiter = limiter.clone();
            let operation = operation.clone();
            async move { limiter.execute(|| operation()).await }.boxed()
        })
    }
}

impl<T, E> Decorate<T, E> for Retry<E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let retry = self.clone();
        Arc::new(move || {
            let retry = retry.clone();
            let operation = operation.clone();
            async move { retry.execute(|| operation()).await }.boxed()
        })
    }
}

impl<T, E> Decorate<T, E> for TimeLimiter
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
        let limiter = self.clone();
        Arc::new(move || {
            let limiter = limiter.clone();
            let operation = operation.clone();
            async move { limiter.execute(|| operation()).await }.boxed()
        })
    }
}

type Recover<T, E> = Arc<dyn Fn(ResilienceError<E>) -> T + Send + Sync>;
type Matches<E> = Arc<dyn Fn(&ResilienceError<E>) -> bool + Send + Sync>;

struct Fallback<T, E> {
    recover: Recover<T, E>,
    matches: Option<Matches<E>>,
}

impl<T, E> Clone for Fallback<T, E> {
    fn clone(&self) -> Self {
        Self { recover: self.recover.clone(), matches: self.matches.clone() }
    }
}

/// Builder collecting guards around a unit of work.
pub struct Decorators<T, E> {
    operation: Operation<T, E>,
    guards: Vec<Arc<dyn Decorate<T, E>>>,
    fallback: Option<Fallback<T, E>>,
}

impl<T, E> fmt::Debug for Decorators<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorators")
            .field("guards", &self.guards.len())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl<T, E> Decorators<T, E>
where
    T: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Start from an async unit of work.
    pub fn of<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let operation: Operation<T, E> = Arc::new(move || {
            let fut = operation();
            async move { fut.await.map_err(ResilienceError::Inner) }.boxed()
        });
        Self::of_operation(operation)
    }

    /// Start from a synchronous unit of work; it runs on the task awaiting the decorated call.
    pub fn of_fn<F>(operation: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let operation = Arc::new(operation);
        let operation: Operation<T, E> = Arc::new(move || {
            let operation = operation.clone();
            async move { operation().map_err(ResilienceError::Inner) }.boxed()
        });
        Self::of_operation(operation)
    }

    /// Start from an operation already producing guard errors.
    pub fn of_operation(operation: Operation<T, E>) -> Self {
        Self { operation, guards: Vec::new(), fallback: None }
    }

    /// Wrap everything added so far in `guard`.
    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: Decorate<T, E> + 'static,
    {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn with_circuit_breaker(self, breaker: &CircuitBreaker) -> Self {
        self.with_guard(breaker.clone())
    }

    pub fn with_bulkhead(self, bulkhead: &Bulkhead) -> Self {
        self.with_guard(bulkhead.clone())
    }

    pub fn with_thread_pool_bulkhead(self, pool: &ThreadPoolBulkhead) -> Self {
        self.with_guard(pool.clone())
    }

    pub fn with_rate_limiter(self, limiter: &RateLimiter) -> Self {
        self.with_guard(limiter.clone())
    }

    pub fn with_retry(self, retry: &Retry<E>) -> Self {
        self.with_guard(retry.clone())
    }

    pub fn with_time_limiter(self, limiter: &TimeLimiter) -> Self {
        self.with_guard(limiter.clone())
    }

    /// Substitute a value for any terminal failure, guard rejections included.
    pub fn with_fallback<F>(mut self, recover: F) -> Self
    where
        F: Fn(ResilienceError<E>) -> T + Send + Sync + 'static,
    {
        self.fallback = Some(Fallback { recover: Arc::new(recover), matches: None });
        self
    }

    /// Substitute a value only for failures accepted by `when`; others propagate.
    pub fn with_fallback_when<P, F>(mut self, when: P, recover: F) -> Self
    where
        P: Fn(&ResilienceError<E>) -> bool + Send + Sync + 'static,
        F: Fn(ResilienceError<E>) -> T + Send + Sync + 'static,
    {
        self.fallback =
            Some(Fallback { recover: Arc::new(recover), matches: Some(Arc::new(when)) });
        self
    }

    /// Fold the guards over the unit of work.
    pub fn decorate(self) -> Decorated<T, E> {
        let operation =
            self.guards.iter().fold(self.operation, |operation, guard| guard.decorate(operation));
        Decorated { operation, fallback: self.fallback }
    }
}

/// The composed callable. Cheap to clone; every call runs the whole guard chain.
pub struct Decorated<T, E> {
    operation: Operation<T, E>,
    fallback: Option<Fallback<T, E>>,
}

impl<T, E> Clone for Decorated<T, E> {
    fn clone(&self) -> Self {
        Self { operation: self.operation.clone(), fallback: self.fallback.clone() }
    }
}

impl<T, E> fmt::Debug for Decorated<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decorated").field("fallback", &self.fallback.is_some()).finish()
    }
}

impl<T, E> Decorated<T, E> {
    /// Run the unit of work through every guard.
    ///
    /// # Errors
    /// The terminal failure of the chain, unless a fallback accepted it.
    pub async fn call(&self) -> Result<T, ResilienceError<E>> {
        let result = (self.operation)().await;
        match (result, &self.fallback) {
            (Ok(value), _) => Ok(value),
            (Err(error), Some(fallback)) => {
                let accepted = fallback.matches.as_ref().map_or(true, |matches| matches(&error));
                if accepted {
                    tracing::debug!(error_kind = ?error.guard_kind(), "Fallback supplied a value");
                    Ok((fallback.recover)(error))
                } else {
                    Err(error)
                }
            }
            (Err(error), None) => Err(error),
        }
    }

    /// The composed operation without the fallback, for feeding into further composition.
    pub fn operation(&self) -> Operation<T, E> {
        self.operation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulkhead::BulkheadConfig;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::retry::RetryConfig;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    /// Records the order in which wrappers see the call.
    struct Tag {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl<T: Send + 'static, E: Send + Sync + 'static> Decorate<T, E> for Tag {
        fn decorate(&self, operation: Operation<T, E>) -> Operation<T, E> {
            let label = self.label;
            let log = self.log.clone();
            Arc::new(move || {
                let operation = operation.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("enter {label}"));
                    let result = operation().await;
                    log.lock().unwrap().push(format!("exit {label}"));
                    result
                }
                .boxed()
            })
        }
    }

    #[tokio::test]
    async fn last_added_guard_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let call = Decorators::of_fn(|| Ok::<_, TestError>(()))
            .with_guard(Tag { label: "inner", log: log.clone() })
            .with_guard(Tag { label: "outer", log: log.clone() })
            .decorate();
        call.call().await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter outer", "enter inner", "exit inner", "exit outer"]
        );
    }

    #[tokio::test]
    async fn retry_outside_breaker_records_every_attempt() {
        let breaker = CircuitBreaker::of_defaults("backend");
        let retry = Retry::new(
            "backend",
            RetryConfig::<TestError>::builder().max_attempts(3).build().unwrap(),
        )
        .with_sleeper(InstantSleeper);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();

        let call = Decorators::of_fn(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(TestError("down"))
        })
        .with_circuit_breaker(&breaker)
        .with_retry(&retry)
        .decorate();

        let err = call.call().await.unwrap_err();
        assert_eq!(err.into_inner(), Some(TestError("down")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.metrics().number_of_failed_calls, 3);
    }

    #[tokio::test]
    async fn breaker_rejection_is_not_retried() {
        let breaker = CircuitBreaker::of_defaults("backend");
        breaker.transition_to_forced_open_state();
        let retry =
            Retry::<TestError>::of_defaults("backend").with_sleeper(InstantSleeper);
        let call = Decorators::of_fn(|| Ok::<_, TestError>(1))
            .with_circuit_breaker(&breaker)
            .with_retry(&retry)
            .decorate();

        let err = call.call().await.unwrap_err();
        assert!(err.is_call_not_permitted());
        assert_eq!(err.guard_name(), Some("backend"));
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);
    }

    #[tokio::test]
    async fn fallback_replaces_guard_rejection() {
        let bulkhead = Bulkhead::new(
            "tiny",
            BulkheadConfig::builder().max_concurrent_calls(1).build().unwrap(),
        );
        let _held = bulkhead.try_acquire_permission().await.expect("permit");
        let call = Decorators::of(|| async { Ok::<_, TestError>("live") })
            .with_bulkhead(&bulkhead)
            .with_fallback(|err| if err.is_bulkhead_full() { "cached" } else { "other" })
            .decorate();
        assert_eq!(call.call().await.unwrap(), "cached");
    }

    #[tokio::test]
    async fn conditional_fallback_lets_other_failures_through() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::builder().sliding_window(2, 2, Default::default()).build().unwrap(),
        );
        let call = Decorators::of_fn(|| Err::<u32, _>(TestError("boom")))
            .with_circuit_breaker(&breaker)
            .with_fallback_when(|err| err.is_call_not_permitted(), |_| 0)
            .decorate();

        assert!(call.call().await.unwrap_err().is_inner());
        assert!(call.call().await.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(call.call().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_pass_through_outer_retry() {
        let limiter = TimeLimiter::of_defaults("slow");
        let retry = Retry::<TestError>::of_defaults("slow").with_sleeper(InstantSleeper);
        let call = Decorators::of(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok::<_, TestError>(())
        })
        .with_time_limiter(&limiter)
        .with_retry(&retry)
        .decorate();

        assert!(call.call().await.unwrap_err().is_timeout());
        assert_eq!(limiter.metrics().timed_out_calls, 1);
    }
}
