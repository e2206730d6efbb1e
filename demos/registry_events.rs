//! Registries hand out one shared guard per name and report every change.
use faultline::prelude::*;
use faultline::RegistryEvent;
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = RateLimiterRegistry::new();
    registry.event_publisher().subscribe(|event: &RegistryEvent<RateLimiter>| {
        println!("registry: {event}");
    });

    registry.add_configuration(
        "burst",
        RateLimiterConfig::builder()
            .limit_for_period(100)
            .limit_refresh_period(Duration::from_secs(1))
            .build()?,
    );

    let search = registry.get_with_config("search", "burst")?;
    let again = registry.get("search");
    println!("search limit: {} / {}", search.limit_for_period(), again.limit_for_period());

    // Live change is seen through every handle to the same entry.
    search.change_limit_for_period(10);
    println!("after change: {}", again.limit_for_period());

    registry.get("checkout");
    println!("names: {:?}", registry.names());

    registry.replace("checkout", RateLimiter::of_defaults("checkout"));
    registry.remove("search");
    registry.clear();
    println!("empty: {}", registry.is_empty());
    Ok(())
}
