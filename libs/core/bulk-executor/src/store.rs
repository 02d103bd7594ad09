//! Store collaborator contract.
//!
//! The executor never talks to a database SDK directly. Anything that can accept a bulk
//! write and report one [`AttemptOutcome`] per item can back it: a Cosmos DB container, a
//! MongoDB collection, or the [`InMemoryStore`](crate::InMemoryStore) used in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::StoreError;
use crate::item::Item;

/// Kind of bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationType {
    Insert,
    Delete,
}

/// A single item submitted in a bulk call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub item: Item,
    /// Deterministic operation identifier, present when idempotency is enabled
    pub idempotency_token: Option<String>,
}

/// Per-item result of one attempt, as reported by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOutcome {
    pub success: bool,
    /// Resource units charged for the attempt
    pub cost_units: f64,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// HTTP-like status code, if the store has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Store's own retry hint; classification may override it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl AttemptOutcome {
    /// A successful attempt charging `cost_units`.
    pub fn ok(cost_units: f64) -> Self {
        Self {
            success: true,
            cost_units,
            ..Default::default()
        }
    }

    /// A failed attempt.
    pub fn failed(
        status: Option<u16>,
        error_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error_code: Some(error_code.into()),
            status,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_cost(mut self, cost_units: f64) -> Self {
        self.cost_units = cost_units;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Human-readable description of the failure.
    pub fn describe(&self) -> String {
        match (&self.error_code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code.clone(),
            (None, Some(message)) => message.clone(),
            (None, None) if self.success => "ok".to_string(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

/// How an existing stored document compares with a submitted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingMatch {
    /// Stored document equals the submitted payload
    Identical,
    /// A different document occupies the key
    Different,
    /// The store cannot tell
    Unknown,
}

/// Bulk-write capability of a document store.
///
/// `bulk_write` must return one outcome per request, in request order. Partial failure is
/// reported per item; `Err` is reserved for connection-level failures of the whole call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Submit a batch of items.
    async fn bulk_write(
        &self,
        operation: OperationType,
        requests: &[WriteRequest],
    ) -> Result<Vec<AttemptOutcome>, StoreError>;

    /// Compare the document stored under `item`'s key with `item`'s payload.
    ///
    /// Used to confirm an insert conflict is a duplicate of our own earlier write.
    async fn compare_existing(&self, _item: &Item) -> Result<ExistingMatch, StoreError> {
        Ok(ExistingMatch::Unknown)
    }

    /// Store name for logging.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_builders() {
        let ok = AttemptOutcome::ok(5.0).with_latency_ms(12.0);
        assert!(ok.success);
        assert_eq!(ok.cost_units, 5.0);
        assert_eq!(ok.latency_ms, 12.0);
        assert_eq!(ok.describe(), "ok");

        let failed = AttemptOutcome::failed(Some(429), "429", "Request rate is large")
            .with_cost(1.0)
            .with_retryable(true);
        assert!(!failed.success);
        assert_eq!(failed.status, Some(429));
        assert_eq!(failed.retryable, Some(true));
        assert_eq!(failed.describe(), "429: Request rate is large");
    }

    #[test]
    fn test_operation_type_strings() {
        assert_eq!(OperationType::Insert.to_string(), "insert");
        assert_eq!("delete".parse::<OperationType>().unwrap(), OperationType::Delete);
    }
}
