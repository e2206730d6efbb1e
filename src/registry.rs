//! Name-keyed stores sharing guard instances.
//!
//! A [`Registry`] hands out the same guard for the same name, creating it on first lookup.
//! Lookups are a single check-and-insert under the write lock, so concurrent callers asking
//! for a new name all receive one instance. Named configurations are added separately and only
//! consulted when an entry is created.
//!
//! Registries are ordinary values: create one at startup, pass it to whoever needs it and call
//! [`Registry::clear`] on teardown.
//!
//! ```rust
//! use faultline::registry::CircuitBreakerRegistry;
//! use faultline::CircuitBreakerConfig;
//!
//! let registry = CircuitBreakerRegistry::new();
//! registry.add_configuration(
//!     "strict",
//!     CircuitBreakerConfig::builder().failure_rate_threshold(10.0).build().unwrap(),
//! );
//! let a = registry.get_with_config("payments", "strict").unwrap();
//! let b = registry.get("payments");
//! assert_eq!(a.config().failure_rate_threshold(), b.config().failure_rate_threshold());
//! ```

use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::RegistryError;
use crate::events::EventPublisher;
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::retry::{Retry, RetryConfig};
use crate::thread_pool_bulkhead::{ThreadPoolBulkhead, ThreadPoolBulkheadConfig};
use crate::time_limiter::{TimeLimiter, TimeLimiterConfig};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A guard that can live in a [`Registry`].
pub trait RegistryEntry: Clone + Send + Sync + 'static {
    type Config: Clone + Default + Send + Sync + 'static;

    fn create(name: &str, config: Self::Config) -> Self;

    fn entry_name(&self) -> &str;
}

impl RegistryEntry for CircuitBreaker {
    type Config = CircuitBreakerConfig;

    fn create(name: &str, config: Self::Config) -> Self {
        CircuitBreaker::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

impl RegistryEntry for Bulkhead {
    type Config = BulkheadConfig;

    fn create(name: &str, config: Self::Config) -> Self {
        Bulkhead::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

impl RegistryEntry for ThreadPoolBulkhead {
    type Config = ThreadPoolBulkheadConfig;

    fn create(name: &str, config: Self::Config) -> Self {
        ThreadPoolBulkhead::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

impl RegistryEntry for RateLimiter {
    type Config = RateLimiterConfig;

    fn create(name: &str, config: Self::Config) -> Self {
        RateLimiter::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

impl<E: 'static> RegistryEntry for Retry<E> {
    type Config = RetryConfig<E>;

    fn create(name: &str, config: Self::Config) -> Self {
        Retry::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

impl RegistryEntry for TimeLimiter {
    type Config = TimeLimiterConfig;

    fn create(name: &str, config: Self::Config) -> Self {
        TimeLimiter::new(name, config)
    }

    fn entry_name(&self) -> &str {
        self.name()
    }
}

pub type CircuitBreakerRegistry = Registry<CircuitBreaker>;
pub type BulkheadRegistry = Registry<Bulkhead>;
pub type ThreadPoolBulkheadRegistry = Registry<ThreadPoolBulkhead>;
pub type RateLimiterRegistry = Registry<RateLimiter>;
pub type RetryRegistry<E> = Registry<Retry<E>>;
pub type TimeLimiterRegistry = Registry<TimeLimiter>;

/// Change to the set of registered entries.
#[derive(Clone)]
pub enum RegistryEvent<G> {
    EntryAdded(G),
    EntryRemoved(G),
    EntryReplaced { old: G, new: G },
}

impl<G: RegistryEntry> RegistryEvent<G> {
    /// Name of the affected entry.
    pub fn name(&self) -> &str {
        match self {
            Self::EntryAdded(entry) | Self::EntryRemoved(entry) => entry.entry_name(),
            Self::EntryReplaced { new, .. } => new.entry_name(),
        }
    }
}

impl<G: RegistryEntry> fmt::Debug for RegistryEvent<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryAdded(_) => f.debug_tuple("EntryAdded").field(&self.name()).finish(),
            Self::EntryRemoved(_) => f.debug_tuple("EntryRemoved").field(&self.name()).finish(),
            Self::EntryReplaced { .. } => {
                f.debug_tuple("EntryReplaced").field(&self.name()).finish()
            }
        }
    }
}

impl<G: RegistryEntry> fmt::Display for RegistryEvent<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryAdded(_) => write!(f, "entry '{}' added", self.name()),
            Self::EntryRemoved(_) => write!(f, "entry '{}' removed", self.name()),
            Self::EntryReplaced { .. } => write!(f, "entry '{}' replaced", self.name()),
        }
    }
}

struct Shared<G: RegistryEntry> {
    entries: RwLock<HashMap<String, G>>,
    configurations: RwLock<HashMap<String, G::Config>>,
    default_config: G::Config,
    events: EventPublisher<RegistryEvent<G>>,
}

/// Name-keyed store of shared guard instances. Clones share the same store.
pub struct Registry<G: RegistryEntry> {
    inner: Arc<Shared<G>>,
}

impl<G: RegistryEntry> Clone for Registry<G> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<G: RegistryEntry> Default for Registry<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: RegistryEntry> fmt::Debug for Registry<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("names", &self.names()).finish()
    }
}

impl<G: RegistryEntry> Registry<G> {
    pub fn new() -> Self {
        Self::with_default_config(G::Config::default())
    }

    /// Registry whose unnamed lookups create entries with `config`.
    pub fn with_default_config(config: G::Config) -> Self {
        Self {
            inner: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                configurations: RwLock::new(HashMap::new()),
                default_config: config,
                events: EventPublisher::new(),
            }),
        }
    }

    pub fn default_config(&self) -> &G::Config {
        &self.inner.default_config
    }

    pub fn event_publisher(&self) -> &EventPublisher<RegistryEvent<G>> {
        &self.inner.events
    }

    /// Store a named configuration for later [`get_with_config`](Self::get_with_config)
    /// calls. Entries already created keep their configuration.
    pub fn add_configuration(&self, config_name: impl Into<String>, config: G::Config) {
        self.inner
            .configurations
            .write()
            .expect("registry configurations poisoned")
            .insert(config_name.into(), config);
    }

    pub fn configuration(&self, config_name: &str) -> Option<G::Config> {
        self.inner
            .configurations
            .read()
            .expect("registry configurations poisoned")
            .get(config_name)
            .cloned()
    }

    /// The entry called `name`, created with the default configuration if missing.
    pub fn get(&self, name: &str) -> G {
        self.get_or_create(name, || Ok::<_, Infallible>(self.inner.default_config.clone()))
            .unwrap_or_else(|never| match never {})
    }

    /// The entry called `name`, created with the named configuration if missing.
    ///
    /// # Errors
    /// `RegistryError::ConfigurationNotFound` if the entry has to be created and `config_name`
    /// was never added.
    pub fn get_with_config(&self, name: &str, config_name: &str) -> Result<G, RegistryError> {
        self.get_or_create(name, || {
            self.configuration(config_name)
                .ok_or_else(|| RegistryError::ConfigurationNotFound(config_name.to_string()))
        })
    }

    /// The entry called `name`, created with `config` if missing.
    pub fn get_with(&self, name: &str, config: G::Config) -> G {
        self.get_or_create(name, || Ok::<_, Infallible>(config))
            .unwrap_or_else(|never| match never {})
    }

    pub fn find(&self, name: &str) -> Option<G> {
        self.inner.entries.read().expect("registry poisoned").get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<G> {
        let removed = self.inner.entries.write().expect("registry poisoned").remove(name);
        if let Some(entry) = &removed {
            self.inner.events.publish(&RegistryEvent::EntryRemoved(entry.clone()));
        }
        removed
    }

    /// Put `entry` under `name`, returning the entry it displaced.
    ///
    /// Replacing is last-writer-wins: callers holding the old instance keep using it.
    pub fn replace(&self, name: impl Into<String>, entry: G) -> Option<G> {
        let name = name.into();
        let old = self
            .inner
            .entries
            .write()
            .expect("registry poisoned")
            .insert(name.clone(), entry.clone());
        match &old {
            Some(old) => {
                warn!(target: "faultline::registry", name = %name, "registry entry replaced; last registration wins");
                self.inner
                    .events
                    .publish(&RegistryEvent::EntryReplaced { old: old.clone(), new: entry });
            }
            None => self.inner.events.publish(&RegistryEvent::EntryAdded(entry)),
        }
        old
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.entries.read().expect("registry poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Emits `EntryRemoved` for each, in name order.
    pub fn clear(&self) {
        let mut removed: Vec<(String, G)> =
            self.inner.entries.write().expect("registry poisoned").drain().collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, entry) in removed {
            self.inner.events.publish(&RegistryEvent::EntryRemoved(entry));
        }
    }

    fn get_or_create<Err>(
        &self,
        name: &str,
        config: impl FnOnce() -> Result<G::Config, Err>,
    ) -> Result<G, Err> {
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        let created = {
            let mut entries = self.inner.entries.write().expect("registry poisoned");
            if let Some(existing) = entries.get(name) {
                return Ok(existing.clone());
            }
            let entry = G::create(name, config()?);
            entries.insert(name.to_string(), entry.clone());
            entry
        };
        tracing::debug!(target: "faultline::registry", name, "registry entry created");
        self.inner.events.publish(&RegistryEvent::EntryAdded(created.clone()));
        Ok(created)
    }
}
