//! Convenient re-exports for common faultline types.
pub use crate::{
    backoff::Backoff,
    bulkhead::{Bulkhead, BulkheadConfig},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    decorators::{Decorate, Decorators},
    error::{ConfigError, ResilienceError},
    jitter::Jitter,
    layer::GuardLayer,
    rate_limiter::{RateLimiter, RateLimiterConfig},
    registry::{
        BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry, RetryRegistry,
        ThreadPoolBulkheadRegistry, TimeLimiterRegistry,
    },
    retry::{Retry, RetryConfig},
    sliding_window::SlidingWindowType,
    thread_pool_bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig},
    time_limiter::{TimeLimiter, TimeLimiterConfig},
};
