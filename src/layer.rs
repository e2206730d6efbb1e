//! Tower middleware running any guard around an inner service.
//!
//! ```rust
//! use faultline::layer::GuardLayer;
//! use faultline::CircuitBreaker;
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let svc = ServiceBuilder::new()
//!     .layer(GuardLayer::new(CircuitBreaker::of_defaults("echo")))
//!     .service(service_fn(|req: String| async move { Ok::<_, std::io::Error>(req) }));
//! let response = svc.oneshot("hello".to_string()).await.unwrap();
//! assert_eq!(response, "hello");
//! # });
//! ```

use crate::decorators::{Decorate, Operation};
use crate::error::ResilienceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Layer applying `guard` to every request.
#[derive(Clone, Debug)]
pub struct GuardLayer<G> {
    guard: G,
}

impl<G> GuardLayer<G> {
    pub fn new(guard: G) -> Self {
        Self { guard }
    }
}

impl<S, G: Clone> Layer<S> for GuardLayer<G> {
    type Service = GuardService<S, G>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, guard: self.guard.clone() }
    }
}

/// Service produced by [`GuardLayer`].
///
/// Requests are cloned for every attempt, so a retry guard re-sends the original request.
#[derive(Clone, Debug)]
pub struct GuardService<S, G> {
    inner: S,
    guard: G,
}

impl<S, G, Req> Service<Req> for GuardService<S, G>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + Sync + 'static,
    G: Decorate<S::Response, S::Error> + Clone + 'static,
    Req: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    // Readiness is awaited per attempt on a clone of the inner service.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let target = Arc::new(Mutex::new((self.inner.clone(), req)));
        let operation: Operation<S::Response, S::Error> = Arc::new(move || {
            let (svc, req) = target.lock().expect("guard service request poisoned").clone();
            async move { svc.oneshot(req).await.map_err(ResilienceError::Inner) }.boxed()
        });
        self.guard.decorate(operation)()
    }
}
