//! Full stack example: retry + breaker + bulkhead + time limiter + fallback.
use faultline::events::log_listener;
use faultline::prelude::*;
use faultline::CircuitBreakerEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(true).init();

    let breaker = CircuitBreaker::new(
        "inventory",
        CircuitBreakerConfig::builder()
            .sliding_window(10, 5, SlidingWindowType::CountBased)
            .wait_duration_in_open_state(Duration::from_secs(30))
            .build()?,
    );
    breaker.event_publisher().subscribe(log_listener::<CircuitBreakerEvent>("inventory"));

    let bulkhead = Bulkhead::new(
        "inventory",
        BulkheadConfig::builder().max_concurrent_calls(32).build()?,
    );
    let limiter = TimeLimiter::new(
        "inventory",
        TimeLimiterConfig::builder().timeout_duration(Duration::from_secs(2)).build()?,
    );
    let retry = Retry::new(
        "inventory",
        RetryConfig::<std::io::Error>::builder()
            .max_attempts(4)
            .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(1))?)
            .jitter(Jitter::equal())
            .build()?,
    );

    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let lookup = Decorators::of(move || {
        let n = a.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "transient"))
            } else {
                Ok("recovered")
            }
        }
    })
    .with_time_limiter(&limiter)
    .with_bulkhead(&bulkhead)
    .with_circuit_breaker(&breaker)
    .with_retry(&retry)
    .with_fallback_when(|err| err.is_call_not_permitted(), |_| "served from cache")
    .decorate();

    let result = lookup.call().await?;
    println!("stack result: {result} after {} attempts", attempts.load(Ordering::SeqCst));
    println!("retry metrics: {:?}", retry.metrics());
    println!("breaker metrics: {:?}", breaker.metrics());
    Ok(())
}
