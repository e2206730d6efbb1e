//! Event subscription shared by every guard and registry.
//!
//! Each guard instance owns an [`EventPublisher`] for its own event type. Listeners are plain
//! closures invoked synchronously, in subscription order, on the thread that triggered the
//! event. Guards always publish after releasing their internal locks, so a listener may call
//! back into the guard that notified it.
//!
//! ```rust
//! use faultline::events::{EventPublisher, EventRecorder};
//!
//! let publisher: EventPublisher<u32> = EventPublisher::new();
//! let recorder = EventRecorder::new();
//! publisher.subscribe(recorder.listener());
//! publisher.publish(&7);
//! assert_eq!(recorder.events(), vec![7]);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A registered event consumer.
pub type Listener<Ev> = Arc<dyn Fn(&Ev) + Send + Sync>;

/// Fan-out of one guard's events to its listeners.
///
/// Clones share the same listener list.
pub struct EventPublisher<Ev> {
    listeners: Arc<RwLock<Vec<Listener<Ev>>>>,
}

impl<Ev> Clone for EventPublisher<Ev> {
    fn clone(&self) -> Self {
        Self { listeners: self.listeners.clone() }
    }
}

impl<Ev> Default for EventPublisher<Ev> {
    fn default() -> Self {
        Self { listeners: Arc::new(RwLock::new(Vec::new())) }
    }
}

impl<Ev> fmt::Debug for EventPublisher<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").field("listeners", &self.listener_count()).finish()
    }
}

impl<Ev> EventPublisher<Ev> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for every future event.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&Ev) + Send + Sync + 'static,
    {
        self.listeners.write().expect("event publisher poisoned").push(Arc::new(listener));
    }

    /// Register an already shared listener.
    pub fn subscribe_shared(&self, listener: Listener<Ev>) {
        self.listeners.write().expect("event publisher poisoned").push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("event publisher poisoned").len()
    }

    /// Whether anyone is listening; lets callers skip building events nobody will see.
    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    /// Deliver an event to every listener on the calling thread.
    pub fn publish(&self, event: &Ev) {
        // Snapshot so listeners can subscribe more listeners without deadlocking.
        let listeners: Vec<Listener<Ev>> =
            self.listeners.read().expect("event publisher poisoned").clone();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Listener collecting events in memory; useful for tests and debugging.
///
/// Holds at most `capacity` events, evicting the oldest once full.
#[derive(Debug)]
pub struct EventRecorder<Ev> {
    events: Arc<Mutex<Vec<Ev>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl<Ev> Clone for EventRecorder<Ev> {
    fn clone(&self) -> Self {
        Self { events: self.events.clone(), capacity: self.capacity, evicted: self.evicted.clone() }
    }
}

impl<Ev: Clone + Send + 'static> Default for EventRecorder<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ev: Clone + Send + 'static> EventRecorder<Ev> {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A listener feeding this recorder, ready for [`EventPublisher::subscribe`].
    pub fn listener(&self) -> impl Fn(&Ev) + Send + Sync + 'static {
        let recorder = self.clone();
        move |event: &Ev| recorder.record(event.clone())
    }

    fn record(&self, event: Ev) {
        let mut events = self.events.lock().expect("event recorder poisoned");
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
    }

    pub fn events(&self) -> Vec<Ev> {
        self.events.lock().expect("event recorder poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event recorder poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().expect("event recorder poisoned").clear();
    }

    /// Number of events dropped because the recorder was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Listener forwarding events to `tracing` at INFO level.
///
/// ```rust
/// use faultline::{events::log_listener, CircuitBreaker};
///
/// let breaker = CircuitBreaker::of_defaults("inventory");
/// breaker.event_publisher().subscribe(log_listener("inventory"));
/// ```
pub fn log_listener<Ev: fmt::Display>(guard: &'static str) -> impl Fn(&Ev) + Send + Sync + 'static {
    move |event: &Ev| {
        tracing::info!(target: "faultline::events", guard, event = %event, "guard_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_receive_events_in_subscription_order() {
        let publisher: EventPublisher<&'static str> = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            let seen = seen.clone();
            publisher.subscribe(move |ev: &&'static str| seen.lock().unwrap().push((id, *ev)));
        }

        publisher.publish(&"opened");

        assert_eq!(*seen.lock().unwrap(), vec![(0, "opened"), (1, "opened"), (2, "opened")]);
        assert_eq!(publisher.listener_count(), 3);
    }

    #[test]
    fn clones_share_listeners() {
        let publisher: EventPublisher<u8> = EventPublisher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        publisher.clone().subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_subscribe_during_publish() {
        let publisher: EventPublisher<u8> = EventPublisher::new();
        let inner = publisher.clone();
        publisher.subscribe(move |_| inner.subscribe(|_| {}));

        publisher.publish(&1);
        assert_eq!(publisher.listener_count(), 2);
    }

    #[test]
    fn recorder_evicts_oldest_when_full() {
        let publisher: EventPublisher<u32> = EventPublisher::new();
        let recorder = EventRecorder::with_capacity(2);
        publisher.subscribe(recorder.listener());

        for i in 0..4 {
            publisher.publish(&i);
        }

        assert_eq!(recorder.events(), vec![2, 3]);
        assert_eq!(recorder.evicted(), 2);
        recorder.clear();
        assert!(recorder.is_empty());
    }
}
