//! Blocking work isolated on a bounded worker pool.
use faultline::prelude::*;
use faultline::ThreadPoolBulkheadEvent;
use std::thread;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let pool = ThreadPoolBulkhead::new(
        "reports",
        ThreadPoolBulkheadConfig::builder()
            .core_thread_pool_size(2)
            .max_thread_pool_size(4)
            .queue_capacity(8)
            .build()?,
    );
    pool.event_publisher().subscribe(|event: &ThreadPoolBulkheadEvent| {
        println!("pool: {event}");
    });

    let mut pending = Vec::new();
    for report in 0..16u64 {
        match pool.submit(move || {
            thread::sleep(Duration::from_millis(50));
            Ok::<_, std::io::Error>(report * report)
        }) {
            Ok(result) => pending.push(result),
            Err(err) => println!("report {report} rejected: {err}"),
        }
    }
    println!("metrics while busy: {:?}", pool.metrics());

    for result in pending {
        println!("report value: {}", result.wait()?);
    }
    pool.shutdown();
    Ok(())
}
