//! Outcome aggregation for the circuit breaker.
//!
//! Two shapes are supported:
//! - **count based**: the last `size` outcomes, oldest overwritten first;
//! - **time based**: outcomes of the last `size` seconds, kept in one bucket per second.
//!
//! Aggregates are maintained incrementally: inserting an outcome adds its contribution and
//! evicting one subtracts it in the same call, so a snapshot is O(1). The window itself is
//! not synchronized; the breaker keeps it behind its state mutex.

use std::collections::VecDeque;
use std::time::Duration;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// How the breaker's window is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlidingWindowType {
    #[default]
    CountBased,
    TimeBased,
}

/// Classification of one completed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Error,
    SlowSuccess,
    SlowError,
}

impl OutcomeKind {
    pub fn classify(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => OutcomeKind::Success,
            (true, false) => OutcomeKind::Error,
            (false, true) => OutcomeKind::SlowSuccess,
            (true, true) => OutcomeKind::SlowError,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeKind::Error | OutcomeKind::SlowError)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, OutcomeKind::SlowSuccess | OutcomeKind::SlowError)
    }
}

/// One recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Clock reading when the call completed.
    pub observed_at_nanos: u64,
    pub duration: Duration,
}

impl Outcome {
    pub fn new(kind: OutcomeKind, observed_at_nanos: u64, duration: Duration) -> Self {
        Self { kind, observed_at_nanos, duration }
    }
}

/// Aggregate counts over everything currently retained by a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSnapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub slow_calls: u64,
    pub slow_failed_calls: u64,
    pub total_duration: Duration,
}

impl WindowSnapshot {
    pub fn successful_calls(&self) -> u64 {
        self.total_calls - self.failed_calls
    }

    pub fn slow_successful_calls(&self) -> u64 {
        self.slow_calls - self.slow_failed_calls
    }

    /// Failed calls as a percentage, or `None` below `minimum_calls`.
    pub fn failure_rate(&self, minimum_calls: u64) -> Option<f32> {
        self.rate(self.failed_calls, minimum_calls)
    }

    /// Slow calls as a percentage, or `None` below `minimum_calls`.
    pub fn slow_call_rate(&self, minimum_calls: u64) -> Option<f32> {
        self.rate(self.slow_calls, minimum_calls)
    }

    /// Mean call duration, zero for an empty window.
    pub fn average_duration(&self) -> Duration {
        match u32::try_from(self.total_calls) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total_duration / n,
            Err(_) => Duration::ZERO,
        }
    }

    fn rate(&self, count: u64, minimum_calls: u64) -> Option<f32> {
        if self.total_calls == 0 || self.total_calls < minimum_calls {
            return None;
        }
        Some(count as f32 * 100.0 / self.total_calls as f32)
    }

    fn add(&mut self, kind: OutcomeKind, duration: Duration) {
        self.total_calls += 1;
        self.total_duration += duration;
        if kind.is_failure() {
            self.failed_calls += 1;
        }
        if kind.is_slow() {
            self.slow_calls += 1;
            if kind.is_failure() {
                self.slow_failed_calls += 1;
            }
        }
    }

    fn remove(&mut self, kind: OutcomeKind, duration: Duration) {
        self.total_calls -= 1;
        self.total_duration = self.total_duration.saturating_sub(duration);
        if kind.is_failure() {
            self.failed_calls -= 1;
        }
        if kind.is_slow() {
            self.slow_calls -= 1;
            if kind.is_failure() {
                self.slow_failed_calls -= 1;
            }
        }
    }

    fn subtract(&mut self, other: &WindowSnapshot) {
        self.total_calls -= other.total_calls;
        self.failed_calls -= other.failed_calls;
        self.slow_calls -= other.slow_calls;
        self.slow_failed_calls -= other.slow_failed_calls;
        self.total_duration = self.total_duration.saturating_sub(other.total_duration);
    }
}

/// Rolling aggregate of recent call outcomes.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    kind: WindowKind,
    totals: WindowSnapshot,
}

#[derive(Debug, Clone)]
enum WindowKind {
    CountBased { capacity: usize, records: VecDeque<(OutcomeKind, Duration)> },
    TimeBased { buckets: Vec<WindowSnapshot>, head_second: u64 },
}

impl SlidingWindow {
    /// Window over the last `size` outcomes.
    pub fn count_based(size: usize) -> Self {
        let capacity = size.max(1);
        Self {
            kind: WindowKind::CountBased { capacity, records: VecDeque::with_capacity(capacity) },
            totals: WindowSnapshot::default(),
        }
    }

    /// Window over the last `seconds` seconds, one bucket per second.
    pub fn time_based(seconds: usize) -> Self {
        Self {
            kind: WindowKind::TimeBased {
                buckets: vec![WindowSnapshot::default(); seconds.max(1)],
                head_second: 0,
            },
            totals: WindowSnapshot::default(),
        }
    }

    pub fn new(window_type: SlidingWindowType, size: usize) -> Self {
        match window_type {
            SlidingWindowType::CountBased => Self::count_based(size),
            SlidingWindowType::TimeBased => Self::time_based(size),
        }
    }

    pub fn window_type(&self) -> SlidingWindowType {
        match self.kind {
            WindowKind::CountBased { .. } => SlidingWindowType::CountBased,
            WindowKind::TimeBased { .. } => SlidingWindowType::TimeBased,
        }
    }

    /// Add an outcome, evicting whatever falls out of the window.
    pub fn record(&mut self, outcome: Outcome) -> WindowSnapshot {
        match &mut self.kind {
            WindowKind::CountBased { capacity, records } => {
                if records.len() == *capacity {
                    if let Some((kind, duration)) = records.pop_front() {
                        self.totals.remove(kind, duration);
                    }
                }
                records.push_back((outcome.kind, outcome.duration));
            }
            WindowKind::TimeBased { buckets, head_second } => {
                let second = outcome.observed_at_nanos / NANOS_PER_SECOND;
                Self::advance(buckets, head_second, &mut self.totals, second);
                // Late outcomes land in the newest bucket so they are not lost to eviction.
                let idx = (*head_second % buckets.len() as u64) as usize;
                buckets[idx].add(outcome.kind, outcome.duration);
            }
        }
        self.totals.add(outcome.kind, outcome.duration);
        self.totals
    }

    /// Current aggregates as of `now_nanos` (time-based windows evict stale buckets first).
    pub fn snapshot(&mut self, now_nanos: u64) -> WindowSnapshot {
        if let WindowKind::TimeBased { buckets, head_second } = &mut self.kind {
            Self::advance(buckets, head_second, &mut self.totals, now_nanos / NANOS_PER_SECOND);
        }
        self.totals
    }

    /// Drop every retained outcome.
    pub fn reset(&mut self) {
        match &mut self.kind {
            WindowKind::CountBased { records, .. } => records.clear(),
            WindowKind::TimeBased { buckets, head_second } => {
                buckets.iter_mut().for_each(|b| *b = WindowSnapshot::default());
                *head_second = 0;
            }
        }
        self.totals = WindowSnapshot::default();
    }

    fn advance(
        buckets: &mut [WindowSnapshot],
        head_second: &mut u64,
        totals: &mut WindowSnapshot,
        now_second: u64,
    ) {
        if now_second <= *head_second {
            return;
        }
        let len = buckets.len() as u64;
        let steps = (now_second - *head_second).min(len);
        for step in 1..=steps {
            let idx = ((*head_second + step) % len) as usize;
            totals.subtract(&buckets[idx]);
            buckets[idx] = WindowSnapshot::default();
        }
        *head_second = now_second;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64, kind: OutcomeKind) -> Outcome {
        Outcome::new(kind, secs * NANOS_PER_SECOND, Duration::from_millis(10))
    }

    #[test]
    fn count_based_overwrites_oldest() {
        let mut window = SlidingWindow::count_based(3);
        window.record(at(0, OutcomeKind::Error));
        window.record(at(0, OutcomeKind::Success));
        window.record(at(0, OutcomeKind::Success));
        assert_eq!(window.snapshot(0).failed_calls, 1);

        let snapshot = window.record(at(0, OutcomeKind::SlowSuccess));
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.failed_calls, 0);
        assert_eq!(snapshot.slow_calls, 1);
        assert_eq!(snapshot.total_duration, Duration::from_millis(30));
    }

    #[test]
    fn rates_undefined_below_minimum() {
        let mut window = SlidingWindow::count_based(10);
        for _ in 0..4 {
            window.record(at(0, OutcomeKind::Error));
        }
        let snapshot = window.snapshot(0);
        assert_eq!(snapshot.failure_rate(5), None);
        assert_eq!(snapshot.failure_rate(4), Some(100.0));
        assert_eq!(snapshot.slow_call_rate(4), Some(0.0));
    }

    #[test]
    fn slow_failures_count_towards_both_rates() {
        let mut window = SlidingWindow::count_based(4);
        window.record(at(0, OutcomeKind::SlowError));
        window.record(at(0, OutcomeKind::Success));
        let snapshot = window.snapshot(0);
        assert_eq!(snapshot.failure_rate(1), Some(50.0));
        assert_eq!(snapshot.slow_call_rate(1), Some(50.0));
        assert_eq!(snapshot.slow_failed_calls, 1);
        assert_eq!(snapshot.slow_successful_calls(), 0);
    }

    #[test]
    fn time_based_evicts_expired_buckets() {
        let mut window = SlidingWindow::time_based(2);
        window.record(at(0, OutcomeKind::Error));
        window.record(at(1, OutcomeKind::Success));
        assert_eq!(window.snapshot(NANOS_PER_SECOND).total_calls, 2);

        // second 0 falls out once we reach second 2
        let snapshot = window.snapshot(2 * NANOS_PER_SECOND);
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.failed_calls, 0);

        let snapshot = window.snapshot(10 * NANOS_PER_SECOND);
        assert_eq!(snapshot, WindowSnapshot::default());
    }

    #[test]
    fn time_based_counts_multiple_outcomes_per_second() {
        let mut window = SlidingWindow::time_based(5);
        for _ in 0..3 {
            window.record(at(4, OutcomeKind::Error));
        }
        window.record(at(5, OutcomeKind::Success));
        let snapshot = window.snapshot(5 * NANOS_PER_SECOND);
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.failure_rate(4), Some(75.0));
    }

    #[test]
    fn reset_clears_everything() {
        let mut window = SlidingWindow::new(SlidingWindowType::TimeBased, 3);
        window.record(at(7, OutcomeKind::Error));
        window.reset();
        assert_eq!(window.snapshot(7 * NANOS_PER_SECOND).total_calls, 0);
        assert_eq!(window.window_type(), SlidingWindowType::TimeBased);
    }
}
