//! Batch executor.
//!
//! Partitions items into fixed-size batches and dispatches them with bounded concurrency.
//! Each batch runs its own retry rounds:
//!
//! 1. Gate on the circuit breaker; a rejected round fails its items as `circuit_open`
//!    without contacting the store
//! 2. Submit the round through [`BulkStore::bulk_write`]
//! 3. Record every outcome, then classify and resolve the failures
//! 4. Report the round to the circuit breaker
//! 5. Back off and resubmit the retryable items, up to `max_retries` rounds
//!
//! Batches after the first wait for the adaptive throttle before their first dispatch.
//! Every wait ends early on shutdown, and nothing is dispatched once shutdown was requested.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::BatchConfig;
use crate::error::{
    BulkError, BulkResult, Classification, ErrorKind, Resolution, classify_outcome, resolve,
};
use crate::item::Item;
use crate::metrics::MetricsCollector;
use crate::resilience::{Admission, CircuitBreaker, jitter_ms, retry_delay};
use crate::store::{AttemptOutcome, BulkStore, ExistingMatch, OperationType, WriteRequest};
use crate::throttle::AdaptiveThrottle;

const CIRCUIT_OPEN_MESSAGE: &str = "Circuit breaker open, batch not dispatched";

/// An item that ended the run without reaching its desired state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub item: Item,
    pub last_error: String,
    pub error_kind: ErrorKind,
    /// Attempts made, including circuit-rejected ones
    pub attempts: u32,
}

/// Outcome of one or more batches. Reports merge commutatively.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Items that took part in the run (cancelled, never-dispatched items excluded)
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedItem>,
    /// Distinct items resubmitted at least once
    pub retried: usize,
    /// Items failed by an open circuit breaker
    pub circuit_rejected: usize,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed.extend(other.failed);
        self.retried += other.retried;
        self.circuit_rejected += other.circuit_rejected;
        self.cancelled |= other.cancelled;
    }

    fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }
}

/// An item in flight together with its attempt history.
#[derive(Debug)]
struct Tracked {
    item: Item,
    attempts: u32,
    last_error: Option<(ErrorKind, String)>,
}

impl Tracked {
    fn new(item: Item) -> Self {
        Self {
            item,
            attempts: 0,
            last_error: None,
        }
    }

    fn into_failed(self) -> FailedItem {
        let (error_kind, last_error) = self
            .last_error
            .unwrap_or((ErrorKind::Transient, "unknown error".to_string()));
        FailedItem {
            item: self.item,
            last_error,
            error_kind,
            attempts: self.attempts,
        }
    }
}

/// Runs bulk operations of one kind with retries, circuit breaking and pacing.
///
/// Cloning is cheap; clones share the store, breaker, metrics and throttle.
pub struct BatchExecutor<S: BulkStore + ?Sized> {
    store: Arc<S>,
    config: Arc<BatchConfig>,
    operation: OperationType,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsCollector>,
    throttle: Arc<Mutex<AdaptiveThrottle>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S: BulkStore + ?Sized> Clone for BatchExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            operation: self.operation,
            breaker: Arc::clone(&self.breaker),
            metrics: Arc::clone(&self.metrics),
            throttle: Arc::clone(&self.throttle),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: BulkStore + ?Sized + 'static> BatchExecutor<S> {
    /// Create an executor with a fresh circuit breaker, metrics collector and throttle.
    pub fn new(store: Arc<S>, config: BatchConfig, operation: OperationType) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker_options.clone());
        let throttle = AdaptiveThrottle::new(
            Duration::from_millis(config.throttle_window_ms),
            config.target_utilization,
            config.provisioned_capacity,
            config.max_backoff_ms,
        );

        Self {
            store,
            config: Arc::new(config),
            operation,
            breaker: Arc::new(breaker),
            metrics: Arc::new(MetricsCollector::new(operation)),
            throttle: Arc::new(Mutex::new(throttle)),
            shutdown: None,
        }
    }

    /// Stop scheduling new batches and retry rounds once the receiver reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Share an existing circuit breaker, e.g. across runs against the same store.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    pub fn circuit_breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Number of batches `item_count` items are split into.
    pub fn batch_count(&self, item_count: usize) -> usize {
        item_count.div_ceil(self.config.batch_size.max(1))
    }

    /// Run every item through the store and fold the per-batch reports together.
    pub async fn execute(&self, items: Vec<Item>) -> BulkResult<BatchReport> {
        let batch_size = self.config.batch_size.max(1);
        let total_batches = self.batch_count(items.len());
        if total_batches == 0 {
            return Ok(BatchReport::default());
        }

        let concurrency = self.config.effective_concurrency(total_batches);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<BatchReport> = JoinSet::new();
        let mut report = BatchReport::default();

        debug!(
            operation = %self.operation,
            items = items.len(),
            batches = total_batches,
            concurrency,
            "Dispatching batches"
        );

        let mut remaining = items.into_iter();
        for index in 0..total_batches {
            // Acquire before spawning so batches start in order and cancellation stops
            // the loop instead of leaving queued tasks behind
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if self.is_cancelled() {
                debug!(batch = index, "Shutdown requested, not dispatching further batches");
                report.cancelled = true;
                break;
            }

            let batch: Vec<Item> = remaining.by_ref().take(batch_size).collect();
            let executor = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                executor.run_batch(index, batch).await
            });
        }

        let mut join_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(batch_report) => report.merge(batch_report),
                Err(e) => {
                    error!(error = %e, "Batch task failed");
                    join_error = Some(e);
                }
            }
        }

        match join_error {
            Some(e) => Err(BulkError::Internal(format!("batch task failed: {}", e))),
            None => Ok(report),
        }
    }

    async fn run_batch(&self, index: usize, items: Vec<Item>) -> BatchReport {
        if index > 0 {
            let delay = self.throttle().next_delay();
            if !delay.is_zero() {
                debug!(batch = index, delay_ms = delay.as_millis() as u64, "Throttling batch");
            }
            if !self.wait(delay).await {
                return BatchReport::cancelled();
            }
        } else if self.is_cancelled() {
            return BatchReport::cancelled();
        }

        let mut report = BatchReport {
            total: items.len(),
            ..Default::default()
        };
        let mut pending: Vec<Tracked> = items.into_iter().map(Tracked::new).collect();
        let mut round: u32 = 0;

        while !pending.is_empty() {
            if round > 0 {
                let delay = retry_delay(
                    round,
                    self.config.base_backoff_ms,
                    self.config.max_backoff_ms,
                    jitter_ms(self.config.base_backoff_ms),
                );
                debug!(
                    batch = index,
                    round,
                    items = pending.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying failed items"
                );

                if !self.wait(delay).await {
                    debug!(
                        batch = index,
                        items = pending.len(),
                        "Shutdown requested, abandoning retries"
                    );
                    report.cancelled = true;
                    report
                        .failed
                        .extend(pending.drain(..).map(Tracked::into_failed));
                    break;
                }
            }

            let Some(admission) = self.breaker.allow() else {
                warn!(batch = index, items = pending.len(), "Circuit open, rejecting batch");
                report.circuit_rejected += pending.len();
                for mut tracked in pending.drain(..) {
                    self.reject(&mut tracked);
                    report.failed.push(tracked.into_failed());
                }
                break;
            };

            report.retried += pending.iter().filter(|t| t.attempts == 1).count();
            pending = self
                .run_round(index, round, admission, pending, &mut report)
                .await;
            round += 1;
        }

        report
    }

    /// Submit one round and return the items to retry.
    async fn run_round(
        &self,
        index: usize,
        round: u32,
        admission: Admission,
        mut pending: Vec<Tracked>,
        report: &mut BatchReport,
    ) -> Vec<Tracked> {
        let requests: Vec<WriteRequest> = pending
            .iter_mut()
            .map(|tracked| {
                tracked.attempts += 1;
                WriteRequest {
                    idempotency_token: self
                        .config
                        .idempotency_enabled
                        .then(|| tracked.item.key.idempotency_token(self.operation)),
                    item: tracked.item.clone(),
                }
            })
            .collect();

        let dispatched = requests.len();
        let outcomes = self.dispatch(&requests).await;

        let round_cost: f64 = outcomes.iter().map(|o| o.cost_units.max(0.0)).sum();
        self.throttle().observe(round_cost);

        let mut retry = Vec::new();
        let mut failed_this_round = 0usize;

        for (mut tracked, mut outcome) in pending.into_iter().zip(outcomes) {
            if outcome.success {
                self.metrics.record(&outcome);
                report.succeeded += 1;
                continue;
            }

            let classification = classify_outcome(&outcome);
            if outcome.error_code.is_none() {
                outcome.error_code = Some(classification.kind.to_string());
            }
            self.metrics.record(&outcome);
            tracked.last_error = Some((classification.kind, outcome.describe()));

            match self.resolution(&tracked, classification).await {
                Resolution::Satisfied => report.succeeded += 1,
                Resolution::Retry if tracked.attempts <= self.config.max_retries => {
                    retry.push(tracked)
                }
                Resolution::Retry | Resolution::Fail => {
                    warn!(
                        batch = index,
                        key = %tracked.item.key,
                        attempts = tracked.attempts,
                        kind = %classification.kind,
                        error = %outcome.describe(),
                        "Item failed"
                    );
                    failed_this_round += 1;
                    report.failed.push(tracked.into_failed());
                }
            }
        }

        let failure_ratio = (failed_this_round + retry.len()) as f64 / dispatched.max(1) as f64;
        if failure_ratio >= self.config.batch_failure_ratio {
            self.breaker.on_failure(admission);
        } else {
            self.breaker.on_success(admission);
        }

        debug!(
            batch = index,
            round,
            dispatched,
            failed = failed_this_round,
            retry = retry.len(),
            cost_units = round_cost,
            "Batch round complete"
        );

        retry
    }

    /// Call the store, turning a connection failure or short response into per-item
    /// retryable failures.
    async fn dispatch(&self, requests: &[WriteRequest]) -> Vec<AttemptOutcome> {
        let started = Instant::now();
        let result = self.store.bulk_write(self.operation, requests).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;

        let mut outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, items = requests.len(), "Bulk call failed");
                let outcome = connection_failure(e.to_string(), latency_ms);
                return vec![outcome; requests.len()];
            }
        };

        if outcomes.len() != requests.len() {
            warn!(
                expected = requests.len(),
                received = outcomes.len(),
                "Store returned a mismatched number of outcomes"
            );
            let message = format!(
                "store returned {} outcomes for {} items",
                outcomes.len(),
                requests.len()
            );
            outcomes.truncate(requests.len());
            outcomes.resize(requests.len(), connection_failure(message, latency_ms));
        }

        outcomes
    }

    async fn resolution(&self, tracked: &Tracked, classification: Classification) -> Resolution {
        if classification.kind != ErrorKind::Conflict
            || self.operation != OperationType::Insert
            || !self.config.idempotency_enabled
        {
            return resolve(classification, self.operation);
        }

        let existing = match self.store.compare_existing(&tracked.item).await {
            Ok(existing) => existing,
            Err(e) => {
                debug!(key = %tracked.item.key, error = %e, "Could not compare existing item");
                ExistingMatch::Unknown
            }
        };

        match existing {
            ExistingMatch::Identical => Resolution::Satisfied,
            ExistingMatch::Different => Resolution::Fail,
            // An earlier ambiguous attempt of ours most likely wrote it
            ExistingMatch::Unknown if tracked.attempts > 1 => Resolution::Satisfied,
            ExistingMatch::Unknown => Resolution::Fail,
        }
    }

    fn reject(&self, tracked: &mut Tracked) {
        let outcome = AttemptOutcome::failed(
            None,
            ErrorKind::CircuitOpen.to_string(),
            CIRCUIT_OPEN_MESSAGE,
        )
        .with_retryable(false);
        self.metrics.record(&outcome);
        tracked.attempts += 1;
        tracked.last_error = Some((ErrorKind::CircuitOpen, outcome.describe()));
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `delay` unless shutdown is requested first.
    ///
    /// Returns `false` when the run was cancelled before or during the wait.
    async fn wait(&self, delay: Duration) -> bool {
        let Some(mut shutdown) = self.shutdown.clone() else {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return true;
        };
        if *shutdown.borrow_and_update() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if *shutdown.borrow_and_update() => return false,
                        Ok(()) => {}
                        // Sender gone, the flag can no longer change
                        Err(_) => {
                            (&mut sleep).await;
                            return !*shutdown.borrow();
                        }
                    }
                }
                _ = &mut sleep => return !*shutdown.borrow(),
            }
        }
    }

    fn throttle(&self) -> MutexGuard<'_, AdaptiveThrottle> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn connection_failure(message: String, latency_ms: f64) -> AttemptOutcome {
    AttemptOutcome::failed(None, "connection", message)
        .with_retryable(true)
        .with_latency_ms(latency_ms)
}
