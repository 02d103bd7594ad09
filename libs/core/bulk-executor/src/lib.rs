//! Resilient Bulk Executor
//!
//! Bulk insert and delete of JSON documents against any store that can accept a batch
//! and report per-item outcomes.
//!
//! ## Features
//!
//! - **Bounded concurrency**: batches dispatched through a semaphore-limited task set
//! - **Retries**: exponential backoff with jitter for throttled, timed-out and transient items
//! - **Circuit breaker**: rolling-window breaker suspends dispatch under sustained failure
//! - **Adaptive throttle**: paces batches to a target share of provisioned capacity
//! - **Idempotency**: deterministic operation tokens; conflicts with our own writes count
//!   as success
//! - **Cost metrics**: per-run cost/latency aggregates, Prometheus export and cost estimates
//!
//! ## Example
//!
//! ```ignore
//! use bulk_executor::{resilient_insert, BatchConfig, InMemoryStore};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let config = BatchConfig::default().with_partition_key_path("/category");
//!
//! let result = resilient_insert(store, documents, &config).await?;
//! assert_eq!(result.succeeded + result.failed, result.total);
//! ```

mod bulk;
mod config;
mod error;
mod executor;
mod item;
mod memory;
mod metrics;
mod pricing;
mod resilience;
mod store;
mod throttle;

// Facade
pub use bulk::{BulkOperator, OperationResult, resilient_delete, resilient_insert};
pub use config::{AUTO_CONCURRENCY, BatchConfig, CircuitBreakerOptions};
pub use error::{BulkError, BulkResult, ErrorKind, StoreError};
pub use executor::FailedItem;
pub use item::{Item, ItemKey, build_items};

// Store contract and the in-memory implementation
pub use memory::InMemoryStore;
pub use store::{AttemptOutcome, BulkStore, ExistingMatch, OperationType, WriteRequest};

// Collaborators callers observe or share across runs
pub use metrics::{MetricsCollector, OperationMetrics, init_metrics, render_metrics};
pub use pricing::{CostEstimate, PricingModel, estimate_cost};
pub use resilience::{Admission, CircuitBreaker, CircuitState};
