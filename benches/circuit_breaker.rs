use criterion::{black_box, criterion_group, criterion_main, Criterion};
use faultline::layer::GuardLayer;
use faultline::{CircuitBreaker, CircuitBreakerConfig, ResilienceError, SlidingWindowType};
use futures::future::Ready;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceBuilder};

// A simple service that just returns its input.
#[derive(Clone)]
struct EchoService;

impl Service<&'static str> for EchoService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: &'static str) -> Self::Future {
        futures::future::ready(Ok(req))
    }
}

// A service that always fails.
#[derive(Clone)]
struct FailingService {
    calls: Arc<AtomicUsize>,
}

impl Service<&'static str> for FailingService {
    type Response = &'static str;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: &'static str) -> Self::Future {
        self.calls.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
    }
}

fn config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::builder()
        .sliding_window(10, 1, SlidingWindowType::CountBased)
        .wait_duration_in_open_state(Duration::from_secs(30))
        .build()
        .unwrap()
}

// Closed-state fast path through execute().
fn breaker_execute_closed(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", config());

    c.bench_function("breaker_execute_closed", |b| {
        b.to_async(&rt).iter(|| async {
            let result = breaker
                .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(black_box(1u64)) })
                .await;
            black_box(result)
        });
    });
}

fn breaker_layer_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = ServiceBuilder::new()
        .layer(GuardLayer::new(CircuitBreaker::new("bench", config())))
        .service(EchoService);

    c.bench_function("breaker_layer_success", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

// Once tripped, calls are rejected without reaching the service.
fn breaker_layer_open(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let svc = ServiceBuilder::new()
        .layer(GuardLayer::new(CircuitBreaker::new("bench", config())))
        .service(FailingService { calls: Arc::new(AtomicUsize::new(0)) });

    c.bench_function("breaker_layer_open", |b| {
        b.to_async(&rt).iter(|| async {
            let mut local_svc = svc.clone();
            let _ = black_box(local_svc.call(black_box("request"))).await;
        });
    });
}

criterion_group!(benches, breaker_execute_closed, breaker_layer_success, breaker_layer_open);
criterion_main!(benches);
