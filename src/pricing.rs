//! Model pricing table and cost calculation.
//!
//! Prices are expressed as USD per 1,000,000 tokens for each of the four
//! billing dimensions. Costs are carried as [`Decimal`] end to end so a
//! sub-microdollar resolution survives storage and summation without
//! binary-float drift.

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::internals::sse::TokenUsage;
use crate::logging::log_info;

const TOKENS_PER_PRICE_UNIT: u64 = 1_000_000;

/// Per-model prices in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: Decimal,
    pub output: Decimal,
    #[serde(default)]
    pub cache_creation: Decimal,
    #[serde(default)]
    pub cache_read: Decimal,
}

impl Default for ModelPricing {
    /// Mid-tier fallback used when a model is missing from the table and
    /// no operator-supplied default exists.
    fn default() -> Self {
        Self {
            input: Decimal::new(3, 0),
            output: Decimal::new(15, 0),
            cache_creation: Decimal::new(375, 2),
            cache_read: Decimal::new(3, 1),
        }
    }
}

/// Cost of one request broken down by billing dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub cache_creation_cost: Decimal,
    pub cache_read_cost: Decimal,
    pub total_cost: Decimal,
}

/// Built-in prices for current Claude models; operator configuration
/// overrides or extends these.
fn builtin_models() -> HashMap<String, ModelPricing> {
    let mut models = HashMap::new();
    models.insert(
        "claude-3-5-haiku-20241022".to_string(),
        ModelPricing {
            input: Decimal::new(8, 1),
            output: Decimal::new(4, 0),
            cache_creation: Decimal::new(1, 0),
            cache_read: Decimal::new(8, 2),
        },
    );
    models.insert(
        "claude-3-5-sonnet-20241022".to_string(),
        ModelPricing {
            input: Decimal::new(3, 0),
            output: Decimal::new(15, 0),
            cache_creation: Decimal::new(375, 2),
            cache_read: Decimal::new(3, 1),
        },
    );
    models.insert(
        "claude-3-opus-20240229".to_string(),
        ModelPricing {
            input: Decimal::new(15, 0),
            output: Decimal::new(75, 0),
            cache_creation: Decimal::new(1875, 2),
            cache_read: Decimal::new(15, 1),
        },
    );
    models
}

struct PricingInner {
    models: HashMap<String, ModelPricing>,
    default: ModelPricing,
}

/// Process-wide pricing table. Static across a run, rebuilt on config
/// reload under its write lock.
pub struct PricingTable {
    inner: RwLock<PricingInner>,
}

impl PricingTable {
    /// Table from operator configuration layered over the built-ins.
    pub fn new(configured: HashMap<String, ModelPricing>, default: ModelPricing) -> Self {
        let mut models = builtin_models();
        models.extend(configured);
        Self {
            inner: RwLock::new(PricingInner { models, default }),
        }
    }

    /// Look up prices for a model; unknown or absent models fall back to
    /// the default pricing.
    pub fn pricing_for(&self, model: Option<&str>) -> ModelPricing {
        let inner = self.inner.read().expect("pricing lock poisoned");
        model
            .and_then(|m| inner.models.get(m).copied())
            .unwrap_or(inner.default)
    }

    /// Compute the cost of the given usage under the model's prices.
    pub fn cost_for(&self, model: Option<&str>, usage: &TokenUsage) -> CostBreakdown {
        let pricing = self.pricing_for(model);
        let per_unit = Decimal::from(TOKENS_PER_PRICE_UNIT);

        let input_cost = Decimal::from(usage.input_tokens) * pricing.input / per_unit;
        let output_cost = Decimal::from(usage.output_tokens) * pricing.output / per_unit;
        let cache_creation_cost =
            Decimal::from(usage.cache_creation_tokens) * pricing.cache_creation / per_unit;
        let cache_read_cost = Decimal::from(usage.cache_read_tokens) * pricing.cache_read / per_unit;

        CostBreakdown {
            input_cost,
            output_cost,
            cache_creation_cost,
            cache_read_cost,
            total_cost: input_cost + output_cost + cache_creation_cost + cache_read_cost,
        }
    }

    /// Swap in a reloaded pricing configuration.
    pub fn update_config(&self, configured: HashMap<String, ModelPricing>, default: ModelPricing) {
        let mut models = builtin_models();
        models.extend(configured);
        let mut inner = self.inner.write().expect("pricing lock poisoned");
        inner.models = models;
        inner.default = default;
        log_info!(model_count = inner.models.len(), "Pricing table reloaded");
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::new(HashMap::new(), ModelPricing::default())
    }
}
