//! Cost projection for bulk runs.
//!
//! Cost units are an abstract per-operation charge (request units on Cosmos DB). Two
//! pricing models are supported: pay-per-operation (serverless) and provisioned
//! throughput billed per hour regardless of use.

use serde::{Deserialize, Serialize};

use crate::metrics::OperationMetrics;

/// Hours used for monthly projections
pub const HOURS_PER_MONTH: f64 = 730.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Default serverless price, USD per million cost units
pub const DEFAULT_PRICE_PER_MILLION_UNITS: f64 = 0.25;

/// Default provisioned price, USD per 100 units/s per hour
pub const DEFAULT_PRICE_PER_HUNDRED_UNITS_HOUR: f64 = 0.008;

/// How cost units translate to money.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PricingModel {
    /// Billed per consumed unit
    PayPerOperation { price_per_million_units: f64 },
    /// Billed per hour for reserved capacity
    Provisioned {
        units_per_second: f64,
        price_per_hundred_units_hour: f64,
    },
}

impl PricingModel {
    pub fn serverless() -> Self {
        PricingModel::PayPerOperation {
            price_per_million_units: DEFAULT_PRICE_PER_MILLION_UNITS,
        }
    }

    pub fn provisioned(units_per_second: f64) -> Self {
        PricingModel::Provisioned {
            units_per_second,
            price_per_hundred_units_hour: DEFAULT_PRICE_PER_HUNDRED_UNITS_HOUR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PricingModel::PayPerOperation { .. } => "pay_per_operation",
            PricingModel::Provisioned { .. } => "provisioned",
        }
    }
}

/// Estimated monetary cost of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEstimate {
    pub model: String,
    pub currency: String,
    pub total_cost_units: f64,
    pub region_count: u32,
    pub estimated_cost: f64,
    /// Realized units/s over provisioned units/s; provisioned model only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<f64>,
    pub projected_monthly_cost: f64,
}

/// Map run totals onto a pricing model.
///
/// Pure function of `metrics.total_cost`, `metrics.total_duration_ms` and `region_count`
/// (0 is treated as a single region).
pub fn estimate_cost(
    metrics: &OperationMetrics,
    model: &PricingModel,
    region_count: u32,
) -> CostEstimate {
    let regions = region_count.max(1);
    let units = metrics.total_cost.max(0.0);
    let hours = metrics.total_duration_ms.max(0.0) / MS_PER_HOUR;

    let (estimated_cost, utilization, projected_monthly_cost) = match model {
        PricingModel::PayPerOperation {
            price_per_million_units,
        } => {
            let cost = units / 1_000_000.0 * price_per_million_units * regions as f64;
            let monthly = if hours > 0.0 {
                cost / hours * HOURS_PER_MONTH
            } else {
                0.0
            };
            (cost, None, monthly)
        }
        PricingModel::Provisioned {
            units_per_second,
            price_per_hundred_units_hour,
        } => {
            let hourly = units_per_second / 100.0 * price_per_hundred_units_hour * regions as f64;
            let utilization = if *units_per_second > 0.0 && metrics.total_duration_ms > 0.0 {
                let realized = units / (metrics.total_duration_ms / 1_000.0);
                Some((realized / units_per_second).max(0.0))
            } else {
                None
            };
            (hourly * hours, utilization, hourly * HOURS_PER_MONTH)
        }
    };

    CostEstimate {
        model: model.name().to_string(),
        currency: "USD".to_string(),
        total_cost_units: units,
        region_count: regions,
        estimated_cost,
        utilization,
        projected_monthly_cost,
    }
}
