//! Document loading and run reporting

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bulk_executor::{
    BatchConfig, BulkOperator, CostEstimate, InMemoryStore, OperationMetrics, OperationResult,
    PricingModel, build_items,
};
use eyre::{Result, WrapErr, eyre};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

/// Provisioned throughput used for the comparison estimate
pub const DEFAULT_UNITS_PER_SECOND: f64 = 400.0;

/// Store simulation knobs
#[derive(Debug, Clone, Default)]
pub struct Simulation {
    pub throttle_rate: f64,
    pub latency_ms: u64,
}

/// Run result plus the cost of the run under both pricing models.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub store_size: usize,
    pub result: OperationResult,
    pub estimates: Vec<CostEstimate>,
}

/// Read a JSON file holding an array of documents (a single object is accepted too).
pub fn read_documents(path: &Path) -> Result<Vec<Value>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
    parse_documents(&raw).wrap_err_with(|| format!("Invalid document file {}", path.display()))
}

fn parse_documents(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Array(documents) => Ok(documents),
        document @ Value::Object(_) => Ok(vec![document]),
        other => Err(eyre!(
            "expected a JSON array of documents, found {}",
            json_type(&other)
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn build_store(simulation: &Simulation) -> InMemoryStore {
    let store = InMemoryStore::new().with_latency(Duration::from_millis(simulation.latency_ms));
    if simulation.throttle_rate > 0.0 {
        store.random_throttle(simulation.throttle_rate);
    }
    store
}

/// Cost of `metrics` under the serverless and provisioned models.
pub fn estimates(
    metrics: &OperationMetrics,
    regions: u32,
    units_per_second: f64,
) -> Vec<CostEstimate> {
    vec![
        metrics.estimate_cost(&PricingModel::serverless(), regions),
        metrics.estimate_cost(&PricingModel::provisioned(units_per_second), regions),
    ]
}

pub async fn insert(
    documents: Vec<Value>,
    config: BatchConfig,
    simulation: &Simulation,
    regions: u32,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    let store = Arc::new(build_store(simulation));
    let operator = BulkOperator::new(Arc::clone(&store), config)?.with_shutdown(shutdown);

    let result = operator.insert(documents).await?;
    Ok(report(&store, result, regions))
}

/// Delete documents; with `seed` the store is first filled with the same documents.
pub async fn delete(
    documents: Vec<Value>,
    config: BatchConfig,
    simulation: &Simulation,
    regions: u32,
    seed: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    let store = Arc::new(build_store(simulation));
    if seed {
        let items = build_items(
            documents.clone(),
            &config.id_field,
            &config.partition_key_path,
        )?;
        info!(items = items.len(), "Seeding store");
        store.seed(items);
    }

    let operator = BulkOperator::new(Arc::clone(&store), config)?.with_shutdown(shutdown);
    let result = operator.delete(documents).await?;
    Ok(report(&store, result, regions))
}

fn report(store: &InMemoryStore, result: OperationResult, regions: u32) -> RunReport {
    let estimates = estimates(&result.metrics, regions, DEFAULT_UNITS_PER_SECOND);
    RunReport {
        store_size: store.len(),
        result,
        estimates,
    }
}
