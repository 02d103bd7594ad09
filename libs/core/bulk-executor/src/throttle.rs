//! Adaptive pacing between batches.
//!
//! Keeps the realized cost rate at or below `target_utilization * provisioned_capacity`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Delay needed so that the cost spent in the last window, re-spent at the target rate,
/// fits the window again.
///
/// `provisioned_capacity` is in cost units per second. Returns 0 when utilization is at or
/// under target; otherwise the shortfall in milliseconds, capped at `max_backoff_ms`.
pub fn compute_delay(
    recent_cost_units: f64,
    window_duration_ms: u64,
    target_utilization: f64,
    provisioned_capacity: f64,
    max_backoff_ms: u64,
) -> u64 {
    if !(recent_cost_units > 0.0) || !(target_utilization > 0.0) || !(provisioned_capacity > 0.0)
    {
        return 0;
    }

    let target_units_per_ms = target_utilization * provisioned_capacity / 1_000.0;
    let window_ms = window_duration_ms as f64;

    let realized_units_per_ms = if window_ms > 0.0 {
        recent_cost_units / window_ms
    } else {
        f64::INFINITY
    };
    if realized_units_per_ms <= target_units_per_ms {
        return 0;
    }

    // Time the same spend takes at the target rate, minus the time already elapsed
    let needed_ms = recent_cost_units / target_units_per_ms;
    let delay = (needed_ms - window_ms).max(0.0).round();

    if delay >= max_backoff_ms as f64 {
        max_backoff_ms
    } else {
        delay as u64
    }
}

/// Tracks cost samples over a trailing window and turns them into inter-batch delays.
#[derive(Debug)]
pub struct AdaptiveThrottle {
    window: Duration,
    target_utilization: f64,
    provisioned_capacity: Option<f64>,
    max_backoff_ms: u64,
    samples: VecDeque<(Instant, f64)>,
}

impl AdaptiveThrottle {
    pub fn new(
        window: Duration,
        target_utilization: f64,
        provisioned_capacity: Option<f64>,
        max_backoff_ms: u64,
    ) -> Self {
        Self {
            window,
            target_utilization,
            provisioned_capacity,
            max_backoff_ms,
            samples: VecDeque::new(),
        }
    }

    /// Record cost spent by a completed bulk call.
    pub fn observe(&mut self, cost_units: f64) {
        if cost_units > 0.0 {
            self.samples.push_back((Instant::now(), cost_units));
        }
        self.evict_expired();
    }

    /// Cost recorded within the trailing window.
    pub fn recent_cost(&mut self) -> f64 {
        self.evict_expired();
        self.samples.iter().map(|(_, cost)| cost).sum()
    }

    /// Delay before the next batch may be dispatched.
    pub fn next_delay(&mut self) -> Duration {
        let Some(capacity) = self.provisioned_capacity else {
            return Duration::ZERO;
        };

        let recent = self.recent_cost();
        let delay_ms = compute_delay(
            recent,
            self.window.as_millis() as u64,
            self.target_utilization,
            capacity,
            self.max_backoff_ms,
        );
        Duration::from_millis(delay_ms)
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay_under_target() {
        // 70 units/s allowed, 50 spent in 1s
        assert_eq!(compute_delay(50.0, 1_000, 0.7, 100.0, 10_000), 0);
        // Exactly at target
        assert_eq!(compute_delay(70.0, 1_000, 0.7, 100.0, 10_000), 0);
    }

    #[test]
    fn test_delay_scales_with_overshoot() {
        // 140 units at 70/s takes 2s, 1s already elapsed
        assert_eq!(compute_delay(140.0, 1_000, 0.7, 100.0, 10_000), 1_000);
        // 280 units takes 4s
        assert_eq!(compute_delay(280.0, 1_000, 0.7, 100.0, 10_000), 3_000);
    }

    #[test]
    fn test_delay_capped_at_max_backoff() {
        assert_eq!(compute_delay(1_000_000.0, 1_000, 0.7, 100.0, 10_000), 10_000);
    }

    #[test]
    fn test_zero_window_uses_full_spend() {
        assert_eq!(compute_delay(70.0, 0, 0.7, 100.0, 10_000), 1_000);
    }

    #[test]
    fn test_degenerate_inputs_never_negative() {
        assert_eq!(compute_delay(0.0, 1_000, 0.7, 100.0, 10_000), 0);
        assert_eq!(compute_delay(-5.0, 1_000, 0.7, 100.0, 10_000), 0);
        assert_eq!(compute_delay(100.0, 1_000, 0.7, 0.0, 10_000), 0);
        assert_eq!(compute_delay(f64::NAN, 1_000, 0.7, 100.0, 10_000), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window_expiry() {
        let mut throttle =
            AdaptiveThrottle::new(Duration::from_secs(1), 0.5, Some(100.0), 10_000);

        throttle.observe(100.0);
        // 100 units in 1s window vs 50/s target -> 1s delay
        assert_eq!(throttle.next_delay(), Duration::from_millis(1_000));

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(throttle.recent_cost(), 0.0);
        assert_eq!(throttle.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_throttle_disabled_without_capacity() {
        let mut throttle = AdaptiveThrottle::new(Duration::from_secs(1), 0.7, None, 10_000);
        throttle.observe(1_000_000.0);
        assert_eq!(throttle.next_delay(), Duration::ZERO);
    }
}
