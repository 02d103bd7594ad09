//! Run metrics
//!
//! [`MetricsCollector`] aggregates cost and latency of every attempt in a run. Each
//! recorded attempt is also emitted through the `metrics` facade so a Prometheus recorder,
//! when installed with [`init_metrics`], sees the same events.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::pricing::{CostEstimate, PricingModel, estimate_cost};
use crate::store::{AttemptOutcome, OperationType};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops; if another recorder is already
/// installed the call logs a warning and leaves it in place.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .inspect_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

/// Render metrics in Prometheus exposition format
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Aggregate metrics of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetrics {
    pub total_cost: f64,
    /// Wall-clock time since the collector was created
    pub total_duration_ms: f64,
    pub max_cost: f64,
    pub avg_cost_per_item: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    /// Number of attempts recorded
    pub attempts: u64,
    pub error_counts: BTreeMap<String, u64>,
}

impl OperationMetrics {
    /// Estimated monetary cost of the run under `model`.
    pub fn estimate_cost(&self, model: &PricingModel, region_count: u32) -> CostEstimate {
        estimate_cost(self, model, region_count)
    }
}

#[derive(Debug, Default)]
struct Totals {
    total_cost: f64,
    total_latency_ms: f64,
    max_cost: f64,
    max_latency_ms: f64,
    attempts: u64,
    error_counts: BTreeMap<String, u64>,
}

/// Accumulates per-attempt cost and latency samples.
///
/// `record` is a single atomic update, safe to call from concurrently running batches.
#[derive(Debug)]
pub struct MetricsCollector {
    operation: OperationType,
    started: Instant,
    totals: Mutex<Totals>,
}

impl MetricsCollector {
    pub fn new(operation: OperationType) -> Self {
        Self {
            operation,
            started: Instant::now(),
            totals: Mutex::new(Totals::default()),
        }
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Fold one attempt outcome into the running totals.
    pub fn record(&self, outcome: &AttemptOutcome) {
        let operation = self.operation.to_string();
        let status = if outcome.success { "success" } else { "failed" };

        counter!(
            "bulk_executor_attempts_total",
            "operation" => operation.clone(),
            "status" => status
        )
        .increment(1);
        counter!("bulk_executor_cost_units_total", "operation" => operation.clone())
            .increment(outcome.cost_units.max(0.0).round() as u64);
        histogram!("bulk_executor_attempt_latency_seconds", "operation" => operation.clone())
            .record(outcome.latency_ms / 1_000.0);
        if let Some(code) = &outcome.error_code {
            counter!(
                "bulk_executor_errors_total",
                "operation" => operation,
                "error_code" => code.clone()
            )
            .increment(1);
        }

        let mut totals = self.lock();
        totals.attempts += 1;
        totals.total_cost += outcome.cost_units;
        totals.total_latency_ms += outcome.latency_ms;
        totals.max_cost = totals.max_cost.max(outcome.cost_units);
        totals.max_latency_ms = totals.max_latency_ms.max(outcome.latency_ms);
        if let Some(code) = &outcome.error_code {
            *totals.error_counts.entry(code.clone()).or_insert(0) += 1;
        }
    }

    /// Current aggregate view.
    pub fn snapshot(&self) -> OperationMetrics {
        let totals = self.lock();
        let (avg_cost_per_item, avg_latency_ms) = if totals.attempts == 0 {
            (0.0, 0.0)
        } else {
            let n = totals.attempts as f64;
            (totals.total_cost / n, totals.total_latency_ms / n)
        };

        OperationMetrics {
            total_cost: totals.total_cost,
            total_duration_ms: self.started.elapsed().as_secs_f64() * 1_000.0,
            max_cost: totals.max_cost,
            avg_cost_per_item,
            avg_latency_ms,
            max_latency_ms: totals.max_latency_ms,
            attempts: totals.attempts,
            error_counts: totals.error_counts.clone(),
        }
    }

    /// Estimated monetary cost of everything recorded so far.
    pub fn estimate_cost(&self, model: &PricingModel, region_count: u32) -> CostEstimate {
        estimate_cost(&self.snapshot(), model, region_count)
    }

    fn lock(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_outcomes() -> Vec<AttemptOutcome> {
        vec![
            AttemptOutcome::ok(5.0).with_latency_ms(10.0),
            AttemptOutcome::ok(7.0).with_latency_ms(30.0),
            AttemptOutcome::failed(Some(429), "throttled", "slow down")
                .with_cost(1.0)
                .with_latency_ms(5.0),
            AttemptOutcome::failed(Some(401), "unauthorized", "bad key").with_latency_ms(15.0),
            AttemptOutcome::failed(Some(429), "throttled", "slow down")
                .with_cost(1.0)
                .with_latency_ms(20.0),
        ]
    }

    #[test]
    fn test_empty_snapshot_has_no_division_by_zero() {
        let collector = MetricsCollector::new(OperationType::Insert);
        let snapshot = collector.snapshot();

        assert_eq!(snapshot.attempts, 0);
        assert_eq!(snapshot.avg_cost_per_item, 0.0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert!(snapshot.error_counts.is_empty());
    }

    #[test]
    fn test_aggregates() {
        let collector = MetricsCollector::new(OperationType::Insert);
        for outcome in sample_outcomes() {
            collector.record(&outcome);
        }

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.attempts, 5);
        assert_eq!(snapshot.total_cost, 14.0);
        assert_eq!(snapshot.max_cost, 7.0);
        assert_eq!(snapshot.avg_cost_per_item, 14.0 / 5.0);
        assert_eq!(snapshot.avg_latency_ms, 16.0);
        assert_eq!(snapshot.max_latency_ms, 30.0);
        assert_eq!(snapshot.error_counts.get("throttled"), Some(&2));
        assert_eq!(snapshot.error_counts.get("unauthorized"), Some(&1));
    }

    #[test]
    fn test_order_independent_aggregation() {
        let forward = MetricsCollector::new(OperationType::Delete);
        let reversed = MetricsCollector::new(OperationType::Delete);
        let rotated = MetricsCollector::new(OperationType::Delete);

        let outcomes = sample_outcomes();
        outcomes.iter().for_each(|o| forward.record(o));
        outcomes.iter().rev().for_each(|o| reversed.record(o));
        outcomes
            .iter()
            .cycle()
            .skip(2)
            .take(outcomes.len())
            .for_each(|o| rotated.record(o));

        let a = forward.snapshot();
        for b in [reversed.snapshot(), rotated.snapshot()] {
            assert_eq!(a.total_cost, b.total_cost);
            assert_eq!(a.avg_latency_ms, b.avg_latency_ms);
            assert_eq!(a.max_latency_ms, b.max_latency_ms);
            assert_eq!(a.error_counts, b.error_counts);
        }
    }

    #[test]
    fn test_render_without_recorder_is_empty_or_text() {
        // Rendering never panics, whether or not a recorder was installed by another test
        let _ = render_metrics();
    }
}
