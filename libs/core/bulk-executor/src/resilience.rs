//! Resilience patterns for bulk execution.
//!
//! This module provides:
//! - **Circuit Breaker**: suspends dispatch when failures pile up in a rolling window
//! - **Backoff**: exponential retry delay with random jitter
//!
//! ## Circuit Breaker States
//!
//! ```text
//! ┌─────────┐  window failures >= threshold  ┌────────┐
//! │ CLOSED  │ ─────────────────────────────> │  OPEN  │ <─┐
//! └─────────┘                                └────────┘   │
//!      ^                                         │        │
//!      │                                         │ reset  │ trial
//!      │                                         v timeout│ failed
//!      │      trial succeeded            ┌─────────────┐  │
//!      └──────────────────────────────── │ HALF-OPEN   │ ─┘
//!                                        └─────────────┘
//! ```
//!
//! In half-open state exactly one caller is let through as the trial. [`CircuitBreaker::allow`]
//! hands every admitted caller an [`Admission`] that goes back with its report; only the
//! trial's own report moves the breaker out of half-open. Reports from calls admitted
//! earlier still count towards the rolling window.

use metrics::counter;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;

use crate::config::CircuitBreakerOptions;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A single trial request is allowed to test recovery.
    HalfOpen,
}

/// Permission to make one call, returned with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while closed.
    Normal,
    /// The single trial of the given half-open period.
    Trial(u64),
}

/// Fixed-capacity ring of the most recent outcomes (`true` = failure).
#[derive(Debug)]
struct RollingWindow {
    slots: Vec<bool>,
    head: usize,
    len: usize,
    failures: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![false; capacity.max(1)],
            head: 0,
            len: 0,
            failures: 0,
        }
    }

    fn push(&mut self, failed: bool) {
        let capacity = self.slots.len();
        if self.len == capacity {
            // Overwrite the oldest entry
            if self.slots[self.head] {
                self.failures -= 1;
            }
        } else {
            self.len += 1;
        }

        self.slots[self.head] = failed;
        if failed {
            self.failures += 1;
        }
        self.head = (self.head + 1) % capacity;
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = false);
        self.head = 0;
        self.len = 0;
        self.failures = 0;
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Incremented on every entry into half-open
    half_open_epoch: u64,
}

impl BreakerInner {
    fn is_current_trial(&self, admission: Admission) -> bool {
        self.state == CircuitState::HalfOpen
            && admission == Admission::Trial(self.half_open_epoch)
    }

    fn open(&mut self) {
        CircuitBreaker::transition(self, CircuitState::Open);
        self.opened_at = Some(Instant::now());
    }
}

/// Thread-safe circuit breaker over a rolling outcome window.
///
/// Every method is a single atomic state update; the lock is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    options: CircuitBreakerOptions,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(options: CircuitBreakerOptions) -> Self {
        let window = RollingWindow::new(options.rolling_window_size);
        Self {
            options,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                trial_in_flight: false,
                half_open_epoch: 0,
            }),
        }
    }

    /// Current state, without triggering the open -> half-open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Failures currently in the rolling window.
    pub fn window_failures(&self) -> usize {
        self.lock().window.failures
    }

    /// Check whether a call may proceed.
    ///
    /// Returns `None` while open and the reset timeout has not elapsed, and for every
    /// caller but the first once half-open.
    pub fn allow(&self) -> Option<Admission> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial(inner.half_open_epoch))
                }
            }
            CircuitState::Open => {
                let reset_timeout = Duration::from_millis(self.options.reset_timeout_ms);
                let elapsed = inner.opened_at.is_none_or(|at| at.elapsed() >= reset_timeout);
                if elapsed {
                    Self::transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Some(Admission::Trial(inner.half_open_epoch))
                } else {
                    None
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.window.push(false);

        if inner.is_current_trial(admission) {
            Self::transition(&mut inner, CircuitState::Closed);
            inner.window.clear();
            inner.opened_at = None;
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.window.push(true);

        match inner.state {
            CircuitState::Closed => {
                if inner.window.failures >= self.options.failure_threshold as usize {
                    inner.open();
                }
            }
            CircuitState::HalfOpen if inner.is_current_trial(admission) => inner.open(),
            // Late result from a call admitted before the circuit opened
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    /// Force the breaker back to closed with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        Self::transition(&mut inner, CircuitState::Closed);
        inner.window.clear();
        inner.opened_at = None;
    }

    fn transition(inner: &mut BreakerInner, next: CircuitState) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        inner.trial_in_flight = false;
        if next == CircuitState::HalfOpen {
            inner.half_open_epoch += 1;
        }

        counter!("bulk_executor_circuit_transitions_total", "state" => next.to_string())
            .increment(1);
        match next {
            CircuitState::Open => tracing::warn!("Circuit breaker OPENED"),
            CircuitState::HalfOpen => {
                tracing::info!("Circuit breaker HALF-OPEN (testing recovery)")
            }
            CircuitState::Closed => tracing::info!("Circuit breaker CLOSED (recovered)"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exponential backoff without jitter: `base * 2^(attempt-1)`, capped at `max`.
///
/// `attempt` is the 1-based retry round.
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    base_ms
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(max_ms)
}

/// Random jitter in `[0, base_ms)`.
pub fn jitter_ms(base_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    ((rand::random::<f64>() * base_ms as f64) as u64).min(base_ms - 1)
}

/// Retry delay for `attempt`: exponential backoff plus `jitter`, capped at `max_ms`.
pub fn retry_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter: u64) -> Duration {
    let delay = backoff_delay_ms(attempt, base_ms, max_ms)
        .saturating_add(jitter)
        .min(max_ms);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, rolling_window_size: usize) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerOptions {
            failure_threshold,
            reset_timeout_ms: 1_000,
            rolling_window_size,
        })
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let breaker = breaker(3, 10);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_some());
    }

    #[test]
    fn test_opens_when_window_failures_reach_threshold() {
        let breaker = breaker(3, 10);

        breaker.on_failure(Admission::Normal);
        breaker.on_success(Admission::Normal);
        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_none());
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let breaker = breaker(3, 4);

        breaker.on_failure(Admission::Normal);
        breaker.on_failure(Admission::Normal);
        breaker.on_success(Admission::Normal);
        breaker.on_success(Admission::Normal);
        // Window: [F, F, S, S] -> pushing S evicts the first F
        breaker.on_success(Admission::Normal);
        assert_eq!(breaker.window_failures(), 1);

        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_reset_timeout() {
        let breaker = breaker(1, 10);
        breaker.on_failure(Admission::Normal);
        assert!(breaker.allow().is_none());

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(breaker.allow().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(breaker.allow().is_some());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one trial call is permitted
        assert!(breaker.allow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_on_success() {
        let breaker = breaker(1, 10);
        breaker.on_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.allow().unwrap();
        assert!(matches!(trial, Admission::Trial(_)));

        breaker.on_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.window_failures(), 0);
        assert!(breaker.allow().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure_and_restarts_timer() {
        let breaker = breaker(1, 10);
        breaker.on_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.allow().unwrap();

        breaker.on_failure(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow().is_none());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.allow().is_none());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(breaker.allow().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reports_do_not_decide_trial() {
        let breaker = breaker(1, 10);
        let early = breaker.allow().unwrap();
        breaker.on_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.allow().unwrap();

        // A call admitted while closed finishes during the trial
        breaker.on_success(early);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_failure(early);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow().is_none());

        breaker.on_success(trial);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_of_earlier_half_open_period_is_stale() {
        let breaker = breaker(1, 10);
        breaker.on_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(1)).await;
        let first_trial = breaker.allow().unwrap();

        breaker.reset();
        breaker.on_failure(Admission::Normal);
        tokio::time::advance(Duration::from_secs(1)).await;
        let second_trial = breaker.allow().unwrap();
        assert_ne!(first_trial, second_trial);

        breaker.on_success(first_trial);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.on_failure(second_trial);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let breaker = breaker(1, 10);
        breaker.on_failure(Admission::Normal);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_some());
    }

    #[test]
    fn test_backoff_calculation() {
        // 100, 200, 400, 800, ... capped at 1000
        assert_eq!(backoff_delay_ms(1, 100, 1_000), 100);
        assert_eq!(backoff_delay_ms(2, 100, 1_000), 200);
        assert_eq!(backoff_delay_ms(3, 100, 1_000), 400);
        assert_eq!(backoff_delay_ms(4, 100, 1_000), 800);
        assert_eq!(backoff_delay_ms(5, 100, 1_000), 1_000);
        assert_eq!(backoff_delay_ms(200, 100, 1_000), 1_000);
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let mut previous = 0;
        for attempt in 1..=40 {
            let delay = backoff_delay_ms(attempt, 100, 10_000);
            assert!(delay >= previous);
            assert!(delay <= 10_000);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..1_000 {
            assert!(jitter_ms(100) < 100);
        }
        assert_eq!(jitter_ms(0), 0);
    }

    #[test]
    fn test_retry_delay_never_exceeds_max() {
        assert_eq!(retry_delay(1, 100, 10_000, 50), Duration::from_millis(150));
        assert_eq!(retry_delay(10, 100, 10_000, 99), Duration::from_millis(10_000));
    }
}
