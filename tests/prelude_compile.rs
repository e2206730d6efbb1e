//! Compile-time prelude coverage test.
use faultline::prelude::*;
use std::time::Duration;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::constant(Duration::from_millis(100));
    let _jitter = Jitter::None;
    let registry = TimeLimiterRegistry::new();
    let limiter = registry.get("echo");
    let layer = GuardLayer::new(limiter);

    let mut svc = layer.layer(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.call(()).await.expect("service call failed");
}
