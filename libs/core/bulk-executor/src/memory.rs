//! In-memory store with fault injection.
//!
//! Backs tests and the loader's simulation mode. Faults are injected per item id, for
//! every item, or per call, so throttling, partial failure, ambiguous timeouts and lost
//! connections can be reproduced deterministically.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ErrorKind, StoreError};
use crate::item::{Item, ItemKey};
use crate::store::{AttemptOutcome, BulkStore, ExistingMatch, OperationType, WriteRequest};

const FAILURE_COST: f64 = 1.0;

#[derive(Debug, Clone)]
struct Fault {
    kind: ErrorKind,
    /// Remaining attempts to fail; `None` fails forever
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    documents: HashMap<ItemKey, Value>,
    item_faults: HashMap<String, Fault>,
    global_fault: Option<ErrorKind>,
    ambiguous: HashSet<String>,
    connection_failures: u32,
    throttle_rate: f64,
}

/// Store fake that keeps documents in a map.
pub struct InMemoryStore {
    state: Mutex<State>,
    calls: AtomicUsize,
    write_cost: f64,
    delete_cost: f64,
    latency: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            calls: AtomicUsize::new(0),
            write_cost: 5.0,
            delete_cost: 5.0,
            latency: Duration::ZERO,
        }
    }

    /// Cost units charged for a successful insert
    pub fn with_write_cost(mut self, cost: f64) -> Self {
        self.write_cost = cost;
        self
    }

    /// Cost units charged for a successful delete
    pub fn with_delete_cost(mut self, cost: f64) -> Self {
        self.delete_cost = cost;
        self
    }

    /// Simulated round-trip time of every bulk call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the given ids with `kind` for their first `times` attempts (`None` = always).
    pub fn fail_items<I, S>(&self, ids: I, kind: ErrorKind, times: Option<u32>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        for id in ids {
            state.item_faults.insert(
                id.into(),
                Fault {
                    kind,
                    remaining: times,
                },
            );
        }
    }

    /// Fail every item with `kind`.
    pub fn fail_all(&self, kind: ErrorKind) {
        self.lock().global_fault = Some(kind);
    }

    /// Apply the write for these ids but report a timeout, once.
    pub fn ambiguous_timeouts<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock();
        state.ambiguous.extend(ids.into_iter().map(Into::into));
    }

    /// Make the next `count` bulk calls fail at connection level.
    pub fn connection_failures(&self, count: u32) {
        self.lock().connection_failures = count;
    }

    /// Throttle each item with probability `rate`.
    pub fn random_throttle(&self, rate: f64) {
        self.lock().throttle_rate = rate.clamp(0.0, 1.0);
    }

    /// Pre-populate the store.
    pub fn seed(&self, items: impl IntoIterator<Item = Item>) {
        let mut state = self.lock();
        for item in items {
            state.documents.insert(item.key, item.payload);
        }
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.item_faults.clear();
        state.global_fault = None;
        state.ambiguous.clear();
        state.connection_failures = 0;
        state.throttle_rate = 0.0;
    }

    /// Number of `bulk_write` calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.lock().documents.contains_key(key)
    }

    pub fn get(&self, key: &ItemKey) -> Option<Value> {
        self.lock().documents.get(key).cloned()
    }

    fn apply(
        state: &mut State,
        operation: OperationType,
        request: &WriteRequest,
        write_cost: f64,
        delete_cost: f64,
    ) -> AttemptOutcome {
        let key = &request.item.key;

        if let Some(kind) = state.global_fault {
            return fault_outcome(kind);
        }

        if let Some(fault) = state.item_faults.get_mut(&key.id) {
            let active = fault.remaining.is_none_or(|n| n > 0);
            if active {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                return fault_outcome(fault.kind);
            }
        }

        if state.throttle_rate > 0.0 && rand::random::<f64>() < state.throttle_rate {
            return fault_outcome(ErrorKind::Throttled);
        }

        match operation {
            OperationType::Insert => {
                if state.documents.contains_key(key) {
                    return AttemptOutcome::failed(
                        Some(409),
                        "Conflict",
                        format!("Entity with the specified id already exists: {}", key),
                    )
                    .with_cost(FAILURE_COST);
                }
                state
                    .documents
                    .insert(key.clone(), request.item.payload.clone());
            }
            OperationType::Delete => {
                if state.documents.remove(key).is_none() {
                    return AttemptOutcome::failed(
                        Some(404),
                        "NotFound",
                        format!("Entity with the specified id does not exist: {}", key),
                    )
                    .with_cost(FAILURE_COST);
                }
            }
        }

        // Write applied, but the caller never hears about it
        if state.ambiguous.remove(&key.id) {
            return fault_outcome(ErrorKind::Timeout);
        }

        match operation {
            OperationType::Insert => AttemptOutcome::ok(write_cost),
            OperationType::Delete => AttemptOutcome::ok(delete_cost),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fault_outcome(kind: ErrorKind) -> AttemptOutcome {
    let (status, message) = match kind {
        ErrorKind::Throttled => (429, "Request rate is large"),
        ErrorKind::Timeout => (408, "Request timed out"),
        ErrorKind::Conflict => (409, "Entity with the specified id already exists"),
        ErrorKind::Unauthorized => (401, "The input authorization token can't serve the request"),
        ErrorKind::Forbidden => (403, "Request blocked by the store"),
        ErrorKind::NotFound => (404, "Entity with the specified id does not exist"),
        ErrorKind::Transient => (503, "Service is currently unavailable"),
        ErrorKind::Malformed => (400, "The document is malformed"),
        ErrorKind::CircuitOpen => (503, "Circuit open"),
    };
    AttemptOutcome::failed(Some(status), status.to_string(), message).with_cost(FAILURE_COST)
}

#[async_trait]
impl BulkStore for InMemoryStore {
    async fn bulk_write(
        &self,
        operation: OperationType,
        requests: &[WriteRequest],
    ) -> Result<Vec<AttemptOutcome>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut outcomes = {
            let mut state = self.lock();
            if state.connection_failures > 0 {
                state.connection_failures -= 1;
                return Err(StoreError::Connection(
                    "connection reset by peer".to_string(),
                ));
            }

            requests
                .iter()
                .map(|request| {
                    Self::apply(
                        &mut state,
                        operation,
                        request,
                        self.write_cost,
                        self.delete_cost,
                    )
                })
                .collect::<Vec<_>>()
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
        for outcome in &mut outcomes {
            outcome.latency_ms = latency_ms;
        }
        Ok(outcomes)
    }

    async fn compare_existing(&self, item: &Item) -> Result<ExistingMatch, StoreError> {
        let state = self.lock();
        Ok(match state.documents.get(&item.key) {
            Some(stored) if *stored == item.payload => ExistingMatch::Identical,
            Some(_) => ExistingMatch::Different,
            None => ExistingMatch::Unknown,
        })
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str) -> WriteRequest {
        WriteRequest {
            item: Item::new(ItemKey::new(id, None), json!({"id": id})),
            idempotency_token: None,
        }
    }

    #[tokio::test]
    async fn test_insert_then_conflict() {
        let store = InMemoryStore::new();

        let first = store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .unwrap();
        assert!(first[0].success);
        assert_eq!(first[0].cost_units, 5.0);

        let second = store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .unwrap();
        assert!(!second[0].success);
        assert_eq!(second[0].status, Some(409));
        assert_eq!(store.len(), 1);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_reports_not_found() {
        let store = InMemoryStore::new();
        let outcomes = store
            .bulk_write(OperationType::Delete, &[request("ghost")])
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, Some(404));
    }

    #[tokio::test]
    async fn test_item_fault_expires() {
        let store = InMemoryStore::new();
        store.fail_items(["a"], ErrorKind::Throttled, Some(1));

        let outcomes = store
            .bulk_write(OperationType::Insert, &[request("a"), request("b")])
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, Some(429));
        assert!(outcomes[1].success);

        let retry = store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .unwrap();
        assert!(retry[0].success);
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_applies_write() {
        let store = InMemoryStore::new();
        store.ambiguous_timeouts(["a"]);

        let outcomes = store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .unwrap();
        assert_eq!(outcomes[0].status, Some(408));
        assert!(store.contains(&ItemKey::new("a", None)));

        let existing = store.compare_existing(&request("a").item).await.unwrap();
        assert_eq!(existing, ExistingMatch::Identical);
    }

    #[tokio::test]
    async fn test_connection_failures() {
        let store = InMemoryStore::new();
        store.connection_failures(1);

        let err = store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
        assert!(store.is_empty());

        assert!(store
            .bulk_write(OperationType::Insert, &[request("a")])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let store = InMemoryStore::new();
        store.fail_all(ErrorKind::Unauthorized);

        let outcomes = store
            .bulk_write(OperationType::Insert, &[request("a"), request("b")])
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.status == Some(401)));
        assert!(store.is_empty());
    }
}
