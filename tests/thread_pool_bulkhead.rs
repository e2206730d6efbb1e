use faultline::{Decorators, ResilienceError, ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TestError(&'static str);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

fn pool(core: usize, max: usize, queue: usize) -> ThreadPoolBulkhead {
    ThreadPoolBulkhead::new(
        "io",
        ThreadPoolBulkheadConfig::builder()
            .core_thread_pool_size(core)
            .max_thread_pool_size(max)
            .queue_capacity(queue)
            .keep_alive_duration(Duration::from_millis(10))
            .build()
            .unwrap(),
    )
}

#[test]
fn accepted_work_never_exceeds_workers_plus_queue() {
    let pool = pool(1, 2, 3);
    let release = Arc::new(Barrier::new(3));
    let started = Arc::new(AtomicUsize::new(0));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut accepted = Vec::new();
    let mut rejected = 0;
    for _ in 0..10 {
        let release = release.clone();
        let started = started.clone();
        let running = running.clone();
        let peak = peak.clone();
        let submitted = pool.submit(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            // The two tasks that start first hold their workers until the test lets go.
            if started.fetch_add(1, Ordering::SeqCst) < 2 {
                release.wait();
            }
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, TestError>(())
        });
        match submitted {
            Ok(pending) => accepted.push(pending),
            Err(err) => {
                assert!(err.is_bulkhead_full());
                rejected += 1;
            }
        }
    }

    assert_eq!(accepted.len(), 5);
    assert_eq!(rejected, 5);
    assert_eq!(pool.metrics().queue_depth, 3);

    release.wait();
    for pending in accepted {
        pending.wait().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decorated_pool_runs_async_work_off_the_caller() {
    let pool = pool(1, 1, 4);
    let call = Decorators::of(|| async {
        let worker = std::thread::current().name().map(str::to_string);
        Ok::<_, TestError>(worker)
    })
    .with_thread_pool_bulkhead(&pool)
    .decorate();

    let worker = call.call().await.unwrap();
    assert_eq!(worker.as_deref(), Some("io-worker-0"));
}

#[test]
fn shutdown_completes_queued_work() {
    let pool = pool(1, 1, 4);
    let gate = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicUsize::new(0));

    let g = gate.clone();
    let first = pool
        .submit(move || {
            g.wait();
            Ok::<_, TestError>(())
        })
        .unwrap();
    let queued: Vec<_> = (0..3)
        .map(|_| {
            let done = done.clone();
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .unwrap()
        })
        .collect();

    pool.shutdown();
    let late: Result<_, ResilienceError<TestError>> = pool.submit(|| Ok(()));
    assert!(late.unwrap_err().is_bulkhead_full());

    gate.wait();
    first.wait().unwrap();
    for pending in queued {
        pending.wait().unwrap();
    }
    assert_eq!(done.load(Ordering::SeqCst), 3);
}

#[test]
fn counts_task_outcomes_and_rejections() {
    let pool = pool(1, 1, 1);
    pool.submit(|| Ok::<_, TestError>(())).unwrap().wait().unwrap();
    let failed = pool.submit(|| Err::<(), _>(TestError("nope"))).unwrap().wait();
    assert_eq!(failed.unwrap_err().into_inner(), Some(TestError("nope")));

    let gate = Arc::new(Barrier::new(2));
    let g = gate.clone();
    let busy = pool
        .submit(move || {
            g.wait();
            g.wait();
            Ok::<_, TestError>(())
        })
        .unwrap();
    gate.wait();
    let queued = pool.submit(|| Ok::<_, TestError>(())).unwrap();
    let rejected: Result<_, ResilienceError<TestError>> = pool.submit(|| Ok(()));
    assert!(rejected.unwrap_err().is_bulkhead_full());
    gate.wait();
    busy.wait().unwrap();
    queued.wait().unwrap();

    let metrics = pool.metrics();
    assert_eq!(metrics.successful_calls, 3);
    assert_eq!(metrics.failed_calls, 1);
    assert_eq!(metrics.rejected_calls, 1);
    assert_eq!(metrics.total_calls(), 5);
    assert!(pool.ptr_eq(&pool.clone()));
}
