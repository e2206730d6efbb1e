#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # faultline
//!
//! Fault-tolerance guards for async Rust: circuit breakers, bulkheads, rate limiters, retries
//! and time limiters, composable around any unit of work.
//!
//! ## Guards
//!
//! - [`CircuitBreaker`] sheds load once the failure or slow-call rate of a sliding window
//!   crosses its threshold, then probes for recovery.
//! - [`Bulkhead`] bounds concurrent calls with a fair semaphore;
//!   [`ThreadPoolBulkhead`] runs work on a bounded worker pool with a bounded queue.
//! - [`RateLimiter`] hands out a fixed number of permits per refresh period.
//! - [`Retry`] re-invokes failed work with configurable [`Backoff`] and [`Jitter`].
//! - [`TimeLimiter`] bounds how long work may run.
//!
//! Guards are shared by cloning, looked up by name through a [`registry::Registry`], composed
//! with [`Decorators`] and mounted on tower services with [`layer::GuardLayer`]. Every guard
//! publishes typed events through its [`events::EventPublisher`].
//!
//! ## Quick Start
//!
//! ```rust
//! use faultline::{CircuitBreaker, Decorators, ResilienceError, Retry, TimeLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = CircuitBreaker::of_defaults("inventory");
//!     let limiter = TimeLimiter::of_defaults("inventory");
//!     let retry = Retry::of_defaults("inventory");
//!
//!     let lookup = Decorators::of(|| async { Ok::<_, std::io::Error>(7) })
//!         .with_time_limiter(&limiter)
//!         .with_circuit_breaker(&breaker)
//!         .with_retry(&retry)
//!         .decorate();
//!
//!     let stock: Result<u32, ResilienceError<std::io::Error>> = lookup.call().await;
//!     assert_eq!(stock.unwrap(), 7);
//! }
//! ```

pub mod adaptive;
pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod decorators;
pub mod error;
pub mod events;
pub mod jitter;
pub mod layer;
pub mod prelude;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod sliding_window;
pub mod thread_pool_bulkhead;
pub mod time_limiter;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadEvent, BulkheadMetrics, BulkheadPermit};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerMetrics,
    CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decorators::{Decorate, Decorated, Decorators, Operation};
pub use error::{ConfigError, GuardKind, RegistryError, ResilienceError};
pub use jitter::Jitter;
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterMetrics};
pub use registry::{Registry, RegistryEntry, RegistryEvent};
pub use retry::{Retry, RetryConfig, RetryEvent, RetryMetrics};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use sliding_window::SlidingWindowType;
pub use thread_pool_bulkhead::{
    PendingResult, ThreadPoolBulkhead, ThreadPoolBulkheadConfig, ThreadPoolBulkheadEvent,
    ThreadPoolBulkheadMetrics,
};
pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterEvent, TimeLimiterMetrics};
