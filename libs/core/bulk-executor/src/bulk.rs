//! Resilient insert/delete entry points.
//!
//! [`BulkOperator`] turns raw JSON documents into keyed items, runs them through a
//! [`BatchExecutor`] and folds the batch reports into an [`OperationResult`].
//!
//! # Example
//!
//! ```rust,ignore
//! use bulk_executor::{BatchConfig, BulkOperator, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let operator = BulkOperator::new(store, BatchConfig::default().with_batch_size(50))?;
//!
//! let result = operator.insert(documents).await?;
//! println!("{} of {} inserted", result.succeeded, result.total);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{Span, field, info, instrument, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::BulkResult;
use crate::executor::{BatchExecutor, FailedItem};
use crate::item::build_items;
use crate::metrics::{MetricsCollector, OperationMetrics};
use crate::resilience::CircuitBreaker;
use crate::store::{BulkStore, OperationType};

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub operation: OperationType,
    pub run_id: Uuid,
    /// Items that took part in the run; reduced by cancellation
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Distinct items that needed at least one retry round
    pub retried: usize,
    /// Number of batches the input was partitioned into
    pub batches: usize,
    pub circuit_rejected: usize,
    pub cancelled: bool,
    pub metrics: OperationMetrics,
    /// Present only when `return_failed_items` is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_items: Option<Vec<FailedItem>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OperationResult {
    /// Whether every item reached its desired state.
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Collaborators of the most recent run.
struct LastRun {
    metrics: Arc<MetricsCollector>,
    breaker: Arc<CircuitBreaker>,
}

/// Runs resilient inserts and deletes against one store.
///
/// Every run starts with a closed circuit breaker of its own unless one is shared with
/// [`BulkOperator::with_shared_circuit_breaker`].
pub struct BulkOperator<S: BulkStore + ?Sized> {
    store: Arc<S>,
    config: BatchConfig,
    shared_breaker: Option<Arc<CircuitBreaker>>,
    shutdown: Option<watch::Receiver<bool>>,
    last_run: Mutex<Option<LastRun>>,
}

impl<S: BulkStore + ?Sized + 'static> BulkOperator<S> {
    /// Create an operator, rejecting an inconsistent configuration up front.
    pub fn new(store: Arc<S>, config: BatchConfig) -> BulkResult<Self> {
        config.validate()?;

        Ok(Self {
            store,
            config,
            shared_breaker: None,
            shutdown: None,
            last_run: Mutex::new(None),
        })
    }

    /// Cancel runs when the receiver reads `true`.
    ///
    /// In-flight batches finish; no new batches or retry rounds start.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Use `breaker` for every run instead of a fresh one per run, so a store that tripped
    /// it stays guarded across calls until the reset timeout passes.
    pub fn with_shared_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.shared_breaker = Some(breaker);
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// The shared breaker, or else the breaker of the most recent run.
    pub fn circuit_breaker(&self) -> Option<Arc<CircuitBreaker>> {
        if let Some(breaker) = &self.shared_breaker {
            return Some(Arc::clone(breaker));
        }
        self.last_run()
            .as_ref()
            .map(|run| Arc::clone(&run.breaker))
    }

    /// Live metrics collector of the most recent run.
    pub fn metrics(&self) -> Option<Arc<MetricsCollector>> {
        self.last_run()
            .as_ref()
            .map(|run| Arc::clone(&run.metrics))
    }

    fn last_run(&self) -> MutexGuard<'_, Option<LastRun>> {
        self.last_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `documents`. Conflicts with our own earlier writes count as success.
    #[instrument(
        skip(self, documents),
        fields(
            operation = "insert",
            store = self.store.name(),
            documents = documents.len(),
            run_id
        )
    )]
    pub async fn insert(&self, documents: Vec<Value>) -> BulkResult<OperationResult> {
        self.run(OperationType::Insert, documents).await
    }

    /// Delete the items referenced by `item_refs`. Items already absent count as deleted.
    #[instrument(
        skip(self, item_refs),
        fields(
            operation = "delete",
            store = self.store.name(),
            documents = item_refs.len(),
            run_id
        )
    )]
    pub async fn delete(&self, item_refs: Vec<Value>) -> BulkResult<OperationResult> {
        self.run(OperationType::Delete, item_refs).await
    }

    async fn run(
        &self,
        operation: OperationType,
        documents: Vec<Value>,
    ) -> BulkResult<OperationResult> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        Span::current().record("run_id", field::display(run_id));

        let items = build_items(
            documents,
            &self.config.id_field,
            &self.config.partition_key_path,
        )?;

        let mut executor =
            BatchExecutor::new(Arc::clone(&self.store), self.config.clone(), operation);
        if let Some(breaker) = &self.shared_breaker {
            executor = executor.with_circuit_breaker(Arc::clone(breaker));
        }
        if let Some(shutdown) = &self.shutdown {
            executor = executor.with_shutdown(shutdown.clone());
        }
        *self.last_run() = Some(LastRun {
            metrics: executor.metrics(),
            breaker: executor.circuit_breaker(),
        });

        let batches = executor.batch_count(items.len());
        info!(
            items = items.len(),
            batches,
            batch_size = self.config.batch_size,
            "Starting bulk run"
        );

        let report = executor.execute(items).await?;
        let metrics = executor.metrics().snapshot();
        let failed = report.failed.len();

        let result = OperationResult {
            operation,
            run_id,
            total: report.total,
            succeeded: report.succeeded,
            failed,
            retried: report.retried,
            batches,
            circuit_rejected: report.circuit_rejected,
            cancelled: report.cancelled,
            metrics,
            failed_items: self.config.return_failed_items.then_some(report.failed),
            started_at,
            finished_at: Utc::now(),
        };

        if result.cancelled {
            warn!(
                total = result.total,
                succeeded = result.succeeded,
                failed = result.failed,
                "Bulk run cancelled"
            );
        } else {
            info!(
                total = result.total,
                succeeded = result.succeeded,
                failed = result.failed,
                retried = result.retried,
                circuit_rejected = result.circuit_rejected,
                cost_units = result.metrics.total_cost,
                duration_ms = result.metrics.total_duration_ms,
                "Bulk run finished"
            );
        }

        Ok(result)
    }
}

/// Insert `documents` into `store` with a fresh operator.
pub async fn resilient_insert<S>(
    store: Arc<S>,
    documents: Vec<Value>,
    config: &BatchConfig,
) -> BulkResult<OperationResult>
where
    S: BulkStore + ?Sized + 'static,
{
    BulkOperator::new(store, config.clone())?
        .insert(documents)
        .await
}

/// Delete the items referenced by `item_refs` from `store` with a fresh operator.
pub async fn resilient_delete<S>(
    store: Arc<S>,
    item_refs: Vec<Value>,
    config: &BatchConfig,
) -> BulkResult<OperationResult>
where
    S: BulkStore + ?Sized + 'static,
{
    BulkOperator::new(store, config.clone())?
        .delete(item_refs)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BulkError;
    use crate::memory::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_input_does_not_contact_store() {
        let store = Arc::new(InMemoryStore::new());
        let result = resilient_insert(Arc::clone(&store), vec![], &BatchConfig::default())
            .await
            .unwrap();

        assert_eq!(result.total, 0);
        assert_eq!(result.succeeded, 0);
        assert_eq!(result.batches, 0);
        assert_eq!(result.metrics.attempts, 0);
        assert_eq!(result.failed_items, Some(vec![]));
        assert!(result.is_complete());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let store = Arc::new(InMemoryStore::new());
        let config = BatchConfig::default().with_batch_size(0);

        let err = resilient_insert(Arc::clone(&store), vec![json!({"id": "a"})], &config)
            .await
            .unwrap_err();
        assert!(matches!(err, BulkError::InvalidConfig(_)));
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_items_omitted_when_disabled() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_all(crate::error::ErrorKind::Forbidden);
        let config = BatchConfig::default().with_return_failed_items(false);

        let result = resilient_insert(store, vec![json!({"id": "a"})], &config)
            .await
            .unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.failed_items.is_none());
    }

    #[tokio::test]
    async fn test_operator_exposes_last_run_metrics() {
        let store = Arc::new(InMemoryStore::new());
        let operator = BulkOperator::new(store, BatchConfig::default()).unwrap();
        assert!(operator.metrics().is_none());
        assert!(operator.circuit_breaker().is_none());

        operator
            .insert(vec![json!({"id": "a"}), json!({"id": "b"})])
            .await
            .unwrap();

        let metrics = operator.metrics().unwrap();
        assert_eq!(metrics.operation(), OperationType::Insert);
        assert_eq!(metrics.snapshot().total_cost, 10.0);
    }

    #[tokio::test]
    async fn test_result_serializes_camel_case() {
        let store = Arc::new(InMemoryStore::new());
        let result = resilient_delete(store, vec![json!({"id": "gone"})], &BatchConfig::default())
            .await
            .unwrap();

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["succeeded"], 1);
        assert!(value.get("runId").is_some());
        assert!(value.get("circuitRejected").is_some());
        assert!(value["metrics"].get("totalCost").is_some());
    }
}
