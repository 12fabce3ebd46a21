//! Cost Estimation
//!
//! Deterministic pre-dispatch cost estimates for a (provider, request) pair.

use std::collections::BTreeMap;

use super::providers::ProviderConfig;
use super::request::{validate_duration, GenerationRequest, OptionalFeature};
use crate::core::settings::CostSettings;
use crate::core::{CoreResult, Usd};

/// Computes `duration / units_per_cost_period * cost_per_unit` plus the
/// add-on price of every optional feature the request enables.
#[derive(Debug, Clone)]
pub struct CostEstimator {
    units_per_cost_period: f64,
    add_on_costs: BTreeMap<OptionalFeature, Usd>,
}

impl Default for CostEstimator {
    fn default() -> Self {
        Self::from_settings(&CostSettings::default())
    }
}

impl CostEstimator {
    pub fn new(units_per_cost_period: f64) -> Self {
        Self {
            units_per_cost_period,
            add_on_costs: BTreeMap::new(),
        }
    }

    pub fn from_settings(settings: &CostSettings) -> Self {
        Self {
            units_per_cost_period: settings.units_per_cost_period,
            add_on_costs: settings.add_on_costs.clone(),
        }
    }

    /// Sets the price of an add-on
    pub fn with_add_on(mut self, feature: OptionalFeature, cost: Usd) -> Self {
        self.add_on_costs.insert(feature, cost);
        self
    }

    pub fn units_per_cost_period(&self) -> f64 {
        self.units_per_cost_period
    }

    pub fn add_on_cost(&self, feature: OptionalFeature) -> Usd {
        self.add_on_costs.get(&feature).copied().unwrap_or(0.0).max(0.0)
    }

    /// Estimated cost of serving `request` with `provider`.
    ///
    /// Fails with `InvalidRequest` when the duration is not positive.
    /// Never returns a negative amount. An estimate too large to represent
    /// is infinite, so it exceeds every cost ceiling.
    pub fn estimate(
        &self,
        provider: &ProviderConfig,
        request: &GenerationRequest,
    ) -> CoreResult<Usd> {
        validate_duration(request.duration_units)?;

        let periods = if self.units_per_cost_period > 0.0 {
            request.duration_units / self.units_per_cost_period
        } else {
            request.duration_units
        };
        let base = periods * provider.cost_per_unit.max(0.0);
        let add_ons: Usd = request
            .features
            .iter()
            .map(|feature| self.add_on_cost(*feature))
            .sum();

        let total = base + add_ons;
        Ok(if total.is_finite() { total.max(0.0) } else { f64::INFINITY })
    }
}
