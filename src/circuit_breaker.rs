//! Circuit breaker driven by failure and slow-call rates over a sliding window.
//!
//! State machine:
//! - `CLOSED`: calls flow; outcomes are recorded. Once the window holds at least
//!   `minimum_number_of_calls` and either rate reaches its threshold the breaker trips to `OPEN`.
//! - `OPEN`: calls are rejected with [`ResilienceError::CallNotPermitted`]. The first admission
//!   attempt after `wait_duration_in_open_state` moves the breaker to `HALF_OPEN`; there is no
//!   background timer.
//! - `HALF_OPEN`: `permitted_number_of_calls_in_half_open_state` probes are admitted. When all of
//!   them completed the breaker closes if both rates are below threshold, otherwise reopens.
//! - `DISABLED`, `FORCED_OPEN` and `METRICS_ONLY` are only entered manually.
//!
//! The current state is mirrored in an atomic so the `CLOSED` admission path never locks.
//! Transitions and outcome recording happen under one mutex; events are published after it
//! is released.

use crate::clock::{duration_nanos, Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::events::EventPublisher;
use crate::sliding_window::{Outcome, OutcomeKind, SlidingWindow, SlidingWindowType, WindowSnapshot};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;
const STATE_DISABLED: u8 = 3;
const STATE_FORCED_OPEN: u8 = 4;
const STATE_METRICS_ONLY: u8 = 5;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open wait elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
    /// Admits everything, records nothing.
    Disabled,
    /// Rejects everything until manually moved.
    ForcedOpen,
    /// Admits everything and records outcomes without ever transitioning.
    MetricsOnly,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
            CircuitState::Disabled => STATE_DISABLED,
            CircuitState::ForcedOpen => STATE_FORCED_OPEN,
            CircuitState::MetricsOnly => STATE_METRICS_ONLY,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            STATE_DISABLED => CircuitState::Disabled,
            STATE_FORCED_OPEN => CircuitState::ForcedOpen,
            STATE_METRICS_ONLY => CircuitState::MetricsOnly,
            _ => CircuitState::Closed,
        }
    }

    /// Whether calls are admitted without consulting the state machine.
    fn admits_unconditionally(self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::MetricsOnly => "METRICS_ONLY",
        };
        f.write_str(label)
    }
}

/// Validated configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration_threshold: Duration,
    sliding_window_type: SlidingWindowType,
    sliding_window_size: usize,
    minimum_number_of_calls: usize,
    wait_duration_in_open_state: Duration,
    permitted_number_of_calls_in_half_open_state: usize,
    max_wait_duration_in_half_open_state: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_number_of_calls_in_half_open_state: 10,
            max_wait_duration_in_half_open_state: Duration::ZERO,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Start a builder from an existing config.
    pub fn to_builder(&self) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: self.clone() }
    }

    /// Failure rate in percent at or above which the breaker trips.
    pub fn failure_rate_threshold(&self) -> f32 {
        self.failure_rate_threshold
    }

    /// Slow-call rate in percent at or above which the breaker trips.
    pub fn slow_call_rate_threshold(&self) -> f32 {
        self.slow_call_rate_threshold
    }

    /// Calls taking at least this long are slow.
    pub fn slow_call_duration_threshold(&self) -> Duration {
        self.slow_call_duration_threshold
    }

    pub fn sliding_window_type(&self) -> SlidingWindowType {
        self.sliding_window_type
    }

    /// Outcomes (count based) or seconds (time based) retained by the window.
    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }

    pub fn minimum_number_of_calls(&self) -> usize {
        self.minimum_number_of_calls
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        self.wait_duration_in_open_state
    }

    pub fn permitted_number_of_calls_in_half_open_state(&self) -> usize {
        self.permitted_number_of_calls_in_half_open_state
    }

    /// Zero means the breaker waits in `HALF_OPEN` until every probe completed.
    pub fn max_wait_duration_in_half_open_state(&self) -> Duration {
        self.max_wait_duration_in_half_open_state
    }

    /// Calls needed in `CLOSED` before rates are defined. A count-based window can never hold
    /// more than its size.
    fn closed_minimum_calls(&self) -> u64 {
        let min = match self.sliding_window_type {
            SlidingWindowType::CountBased => {
                self.minimum_number_of_calls.min(self.sliding_window_size)
            }
            SlidingWindowType::TimeBased => self.minimum_number_of_calls,
        };
        min as u64
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.slow_call_duration_threshold.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "slow_call_duration_threshold",
                value: self.slow_call_duration_threshold,
            });
        }
        if self.wait_duration_in_open_state.is_zero() {
            return Err(ConfigError::InvalidDuration {
                field: "wait_duration_in_open_state",
                value: self.wait_duration_in_open_state,
            });
        }
        if self.sliding_window_size == 0 {
            return Err(ConfigError::Zero { field: "sliding_window_size" });
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::Zero { field: "minimum_number_of_calls" });
        }
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::Zero { field: "permitted_number_of_calls_in_half_open_state" });
        }
        Ok(())
    }
}

fn check_percentage(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidPercentage { field, value })
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Shorthand for type, size and minimum calls in one go.
    pub fn sliding_window(
        mut self,
        size: usize,
        minimum_number_of_calls: usize,
        window_type: SlidingWindowType,
    ) -> Self {
        self.config.sliding_window_size = size;
        self.config.minimum_number_of_calls = minimum_number_of_calls;
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = wait;
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Something observable that happened inside a breaker.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    StateTransition { from: CircuitState, to: CircuitState },
    Success { duration: Duration },
    Error { duration: Duration },
    CallNotPermitted { state: CircuitState },
    Reset,
    FailureRateExceeded { rate: f32 },
    SlowCallRateExceeded { rate: f32 },
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateTransition { from, to } => write!(f, "state transition {} -> {}", from, to),
            Self::Success { duration } => write!(f, "call succeeded in {:?}", duration),
            Self::Error { duration } => write!(f, "call failed after {:?}", duration),
            Self::CallNotPermitted { state } => write!(f, "call not permitted while {}", state),
            Self::Reset => f.write_str("reset"),
            Self::FailureRateExceeded { rate } => write!(f, "failure rate {:.1}% exceeded", rate),
            Self::SlowCallRateExceeded { rate } => {
                write!(f, "slow call rate {:.1}% exceeded", rate)
            }
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Percent, `None` until enough calls were recorded.
    pub failure_rate: Option<f32>,
    /// Percent, `None` until enough calls were recorded.
    pub slow_call_rate: Option<f32>,
    pub number_of_buffered_calls: u64,
    pub number_of_failed_calls: u64,
    pub number_of_successful_calls: u64,
    pub number_of_slow_calls: u64,
    pub number_of_slow_successful_calls: u64,
    pub number_of_slow_failed_calls: u64,
    pub number_of_not_permitted_calls: u64,
}

#[derive(Debug)]
struct Machine {
    state: CircuitState,
    entered_at_nanos: u64,
    window: SlidingWindow,
    half_open_remaining: usize,
    /// Incremented on every entry into `HALF_OPEN`.
    half_open_period: u64,
    metrics_only_failure_exceeded: bool,
    metrics_only_slow_exceeded: bool,
}

/// How a call was let through: `probe` names the half-open period whose slot it holds.
#[derive(Debug, Clone, Copy)]
struct Admission {
    probe: Option<u64>,
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    machine: Mutex<Machine>,
    not_permitted: AtomicU64,
    events: EventPublisher<CircuitBreakerEvent>,
}

/// Circuit breaker guarding async operations.
///
/// Clones share the same state, so every handle observes and affects one lifecycle.
///
/// # Examples
/// ```
/// use faultline::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::builder()
///     .failure_rate_threshold(25.0)
///     .minimum_number_of_calls(20)
///     .wait_duration_in_open_state(Duration::from_secs(5))
///     .build()
///     .unwrap();
/// let breaker = CircuitBreaker::new("payments", config);
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, MonotonicClock::default())
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Create a breaker reading time from `clock` (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let machine = Machine {
            state: CircuitState::Closed,
            entered_at_nanos: clock.now_nanos(),
            window: SlidingWindow::new(config.sliding_window_type, config.sliding_window_size),
            half_open_remaining: 0,
            half_open_period: 0,
            metrics_only_failure_exceeded: false,
            metrics_only_slow_exceeded: false,
        };
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                config,
                clock,
                state: AtomicU8::new(STATE_CLOSED),
                machine: Mutex::new(machine),
                not_permitted: AtomicU64::new(0),
                events: EventPublisher::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn event_publisher(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.inner.events
    }

    /// True when both handles refer to the same breaker.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Executes the operation under breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::CallNotPermitted` without running the operation when the
    /// breaker refuses the call. Otherwise the operation's own result is returned unchanged
    /// after its outcome was recorded. Every error counts as a failure.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let Some(admission) = self.acquire() else {
            return Err(ResilienceError::CallNotPermitted {
                name: self.inner.name.clone(),
                state: self.state(),
            });
        };

        // Hands the probe slot back if the call is cancelled or panics. Only calls admitted
        // as probes of the current half-open period hold a slot.
        struct PermitGuard<'a> {
            breaker: &'a CircuitBreaker,
            probe: Option<u64>,
        }
        impl Drop for PermitGuard<'_> {
            fn drop(&mut self) {
                if let Some(period) = self.probe {
                    self.breaker.release_probe(period);
                }
            }
        }
        let mut guard = PermitGuard { breaker: self, probe: admission.probe };

        let start = self.inner.clock.now_nanos();
        let result = operation().await;
        let elapsed = Duration::from_nanos(self.inner.clock.now_nanos().saturating_sub(start));
        guard.probe = None;

        match &result {
            Ok(_) => self.on_success(elapsed),
            Err(_) => self.on_error(elapsed),
        }
        result
    }

    /// Ask for admission of one call. The only side effects are lazy time-driven transitions
    /// and, in `HALF_OPEN`, consuming one probe slot.
    pub fn try_acquire_permission(&self) -> bool {
        self.acquire().is_some()
    }

    fn acquire(&self) -> Option<Admission> {
        if self.state().admits_unconditionally() {
            return Some(Admission { probe: None });
        }

        let now = self.inner.clock.now_nanos();
        let mut events = Vec::new();
        let (admission, state) = {
            let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
            let elapsed = now.saturating_sub(machine.entered_at_nanos);
            match machine.state {
                CircuitState::Open => {
                    if elapsed >= duration_nanos(self.inner.config.wait_duration_in_open_state) {
                        self.transition(&mut machine, CircuitState::HalfOpen, now, &mut events);
                        (self.take_probe(&mut machine), CircuitState::HalfOpen)
                    } else {
                        (None, CircuitState::Open)
                    }
                }
                CircuitState::HalfOpen => {
                    let max_wait = self.inner.config.max_wait_duration_in_half_open_state;
                    if !max_wait.is_zero() && elapsed >= duration_nanos(max_wait) {
                        self.transition(&mut machine, CircuitState::Open, now, &mut events);
                        (None, CircuitState::Open)
                    } else {
                        (self.take_probe(&mut machine), CircuitState::HalfOpen)
                    }
                }
                CircuitState::ForcedOpen => (None, CircuitState::ForcedOpen),
                other => (Some(Admission { probe: None }), other),
            }
        };

        if admission.is_none() {
            self.inner.not_permitted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(breaker = %self.inner.name, state = %state, "Circuit breaker: call not permitted");
            events.push(CircuitBreakerEvent::CallNotPermitted { state });
        }
        self.publish(events);
        admission
    }

    /// Return a permission obtained from [`try_acquire_permission`](Self::try_acquire_permission)
    /// for a call that was never made.
    pub fn release_permission(&self) {
        if self.state() != CircuitState::HalfOpen {
            return;
        }
        let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
        if machine.state == CircuitState::HalfOpen {
            let permitted = self.inner.config.permitted_number_of_calls_in_half_open_state;
            machine.half_open_remaining = (machine.half_open_remaining + 1).min(permitted);
        }
    }

    /// Return a probe slot taken during half-open period `period`. Slots from an earlier
    /// period, or calls admitted outside `HALF_OPEN`, never add budget.
    fn release_probe(&self, period: u64) {
        let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
        if machine.state == CircuitState::HalfOpen && machine.half_open_period == period {
            let permitted = self.inner.config.permitted_number_of_calls_in_half_open_state;
            machine.half_open_remaining = (machine.half_open_remaining + 1).min(permitted);
        }
    }

    /// Record a successful call that took `duration`.
    pub fn on_success(&self, duration: Duration) {
        self.on_result(false, duration);
    }

    /// Record a failed call that took `duration`.
    pub fn on_error(&self, duration: Duration) {
        self.on_result(true, duration);
    }

    fn on_result(&self, failed: bool, duration: Duration) {
        let now = self.inner.clock.now_nanos();
        let slow = duration >= self.inner.config.slow_call_duration_threshold;
        let mut events = vec![if failed {
            CircuitBreakerEvent::Error { duration }
        } else {
            CircuitBreakerEvent::Success { duration }
        }];

        {
            let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
            match machine.state {
                CircuitState::Closed | CircuitState::HalfOpen | CircuitState::MetricsOnly => {
                    let outcome = Outcome::new(OutcomeKind::classify(failed, slow), now, duration);
                    machine.window.record(outcome);
                    self.evaluate(&mut machine, now, &mut events);
                }
                CircuitState::Open | CircuitState::ForcedOpen | CircuitState::Disabled => {}
            }
        }

        self.publish(events);
    }

    fn evaluate(&self, machine: &mut Machine, now: u64, events: &mut Vec<CircuitBreakerEvent>) {
        let config = &self.inner.config;
        match machine.state {
            CircuitState::Closed => {
                let snapshot = machine.window.snapshot(now);
                let minimum = config.closed_minimum_calls();
                if let Some(exceeded) = self.exceeded(&snapshot, minimum) {
                    tracing::warn!(
                        breaker = %self.inner.name,
                        failure_rate = ?snapshot.failure_rate(minimum),
                        slow_call_rate = ?snapshot.slow_call_rate(minimum),
                        calls = snapshot.total_calls,
                        "Circuit breaker tripped"
                    );
                    events.push(exceeded);
                    self.transition(machine, CircuitState::Open, now, events);
                }
            }
            CircuitState::HalfOpen => {
                let snapshot = machine.window.snapshot(now);
                let probes = config.permitted_number_of_calls_in_half_open_state as u64;
                if snapshot.total_calls < probes {
                    return;
                }
                match self.exceeded(&snapshot, probes) {
                    Some(exceeded) => {
                        tracing::warn!(breaker = %self.inner.name, "Circuit breaker: probes failed");
                        events.push(exceeded);
                        self.transition(machine, CircuitState::Open, now, events);
                    }
                    None => self.transition(machine, CircuitState::Closed, now, events),
                }
            }
            CircuitState::MetricsOnly => {
                let snapshot = machine.window.snapshot(now);
                let minimum = config.closed_minimum_calls();
                if let Some(rate) = snapshot.failure_rate(minimum) {
                    let above = rate >= config.failure_rate_threshold;
                    if above && !machine.metrics_only_failure_exceeded {
                        events.push(CircuitBreakerEvent::FailureRateExceeded { rate });
                    }
                    machine.metrics_only_failure_exceeded = above;
                }
                if let Some(rate) = snapshot.slow_call_rate(minimum) {
                    let above = rate >= config.slow_call_rate_threshold;
                    if above && !machine.metrics_only_slow_exceeded {
                        events.push(CircuitBreakerEvent::SlowCallRateExceeded { rate });
                    }
                    machine.metrics_only_slow_exceeded = above;
                }
            }
            _ => {}
        }
    }

    /// The threshold event to publish if either rate is at or above its threshold.
    fn exceeded(&self, snapshot: &WindowSnapshot, minimum: u64) -> Option<CircuitBreakerEvent> {
        let config = &self.inner.config;
        if let Some(rate) = snapshot.failure_rate(minimum) {
            if rate >= config.failure_rate_threshold {
                return Some(CircuitBreakerEvent::FailureRateExceeded { rate });
            }
        }
        if let Some(rate) = snapshot.slow_call_rate(minimum) {
            if rate >= config.slow_call_rate_threshold {
                return Some(CircuitBreakerEvent::SlowCallRateExceeded { rate });
            }
        }
        None
    }

    fn take_probe(&self, machine: &mut Machine) -> Option<Admission> {
        if machine.half_open_remaining > 0 {
            machine.half_open_remaining -= 1;
            Some(Admission { probe: Some(machine.half_open_period) })
        } else {
            None
        }
    }

    /// Move to `to`, resetting the window and entry timestamp. Must hold the machine lock.
    fn transition(
        &self,
        machine: &mut Machine,
        to: CircuitState,
        now: u64,
        events: &mut Vec<CircuitBreakerEvent>,
    ) {
        let from = machine.state;
        if from == to {
            return;
        }
        let config = &self.inner.config;
        machine.state = to;
        machine.entered_at_nanos = now;
        machine.metrics_only_failure_exceeded = false;
        machine.metrics_only_slow_exceeded = false;
        match to {
            CircuitState::HalfOpen => {
                let probes = config.permitted_number_of_calls_in_half_open_state;
                machine.window = SlidingWindow::count_based(probes);
                machine.half_open_remaining = probes;
                machine.half_open_period += 1;
            }
            _ => {
                machine.window =
                    SlidingWindow::new(config.sliding_window_type, config.sliding_window_size);
                machine.half_open_remaining = 0;
            }
        }
        self.inner.state.store(to.to_u8(), Ordering::Release);

        match to {
            CircuitState::Open | CircuitState::ForcedOpen => {
                tracing::warn!(breaker = %self.inner.name, %from, %to, "Circuit breaker → open")
            }
            _ => tracing::info!(breaker = %self.inner.name, %from, %to, "Circuit breaker transition"),
        }
        events.push(CircuitBreakerEvent::StateTransition { from, to });
    }

    fn manual_transition(&self, to: CircuitState) {
        let now = self.inner.clock.now_nanos();
        let mut events = Vec::new();
        {
            let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
            self.transition(&mut machine, to, now, &mut events);
        }
        self.publish(events);
    }

    pub fn transition_to_closed_state(&self) {
        self.manual_transition(CircuitState::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.manual_transition(CircuitState::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.manual_transition(CircuitState::HalfOpen);
    }

    pub fn transition_to_disabled_state(&self) {
        self.manual_transition(CircuitState::Disabled);
    }

    pub fn transition_to_forced_open_state(&self) {
        self.manual_transition(CircuitState::ForcedOpen);
    }

    pub fn transition_to_metrics_only_state(&self) {
        self.manual_transition(CircuitState::MetricsOnly);
    }

    /// Return to a fresh `CLOSED` breaker: empty window, zeroed counters.
    pub fn reset(&self) {
        let now = self.inner.clock.now_nanos();
        let mut events = Vec::new();
        {
            let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
            self.transition(&mut machine, CircuitState::Closed, now, &mut events);
            machine.window.reset();
            machine.entered_at_nanos = now;
            self.inner.not_permitted.store(0, Ordering::Relaxed);
        }
        events.push(CircuitBreakerEvent::Reset);
        self.publish(events);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.inner.clock.now_nanos();
        let (state, snapshot) = {
            let mut machine = self.inner.machine.lock().expect("circuit breaker poisoned");
            (machine.state, machine.window.snapshot(now))
        };
        let minimum = match state {
            CircuitState::HalfOpen => {
                self.inner.config.permitted_number_of_calls_in_half_open_state as u64
            }
            _ => self.inner.config.closed_minimum_calls(),
        };
        CircuitBreakerMetrics {
            state,
            failure_rate: snapshot.failure_rate(minimum),
            slow_call_rate: snapshot.slow_call_rate(minimum),
            number_of_buffered_calls: snapshot.total_calls,
            number_of_failed_calls: snapshot.failed_calls,
            number_of_successful_calls: snapshot.successful_calls(),
            number_of_slow_calls: snapshot.slow_calls,
            number_of_slow_successful_calls: snapshot.slow_successful_calls(),
            number_of_slow_failed_calls: snapshot.slow_failed_calls,
            number_of_not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, events: Vec<CircuitBreakerEvent>) {
        if !self.inner.events.has_listeners() {
            return;
        }
        for event in &events {
            self.inner.events.publish(event);
        }
    }
}
