//! Generative Providers
//!
//! Provider configuration, the backend invocation seam, and the capability
//! filter that decides whether a provider can serve a request at all.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::request::{GenerationRequest, OptionalFeature};
use super::selection::SkipReason;
use crate::core::{CapabilityClass, CoreError, CoreResult, ProviderId, ProviderRank, Usd};

// =============================================================================
// Provider Configuration
// =============================================================================

/// Static description of one provider in a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_id: ProviderId,
    pub capability_class: CapabilityClass,
    /// Price for one cost period (e.g. one minute of output)
    pub cost_per_unit: Usd,
    /// Longest output the provider accepts, in duration units
    pub max_duration_units: f64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub rank: ProviderRank,
    /// Add-ons this provider can render. `None` means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_features: Option<BTreeSet<OptionalFeature>>,
}

impl ProviderConfig {
    /// Creates a primary provider with no feature restrictions
    pub fn new(
        provider_id: impl Into<ProviderId>,
        capability_class: CapabilityClass,
        cost_per_unit: Usd,
        max_duration_units: f64,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            capability_class,
            cost_per_unit,
            max_duration_units,
            region: String::new(),
            rank: ProviderRank::Primary,
            supported_features: None,
        }
    }

    pub fn with_rank(mut self, rank: ProviderRank) -> Self {
        self.rank = rank;
        self
    }

    /// Marks the provider as a fallback
    pub fn as_fallback(self) -> Self {
        self.with_rank(ProviderRank::Fallback)
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_supported_features(
        mut self,
        features: impl IntoIterator<Item = OptionalFeature>,
    ) -> Self {
        self.supported_features = Some(features.into_iter().collect());
        self
    }

    pub fn supports_feature(&self, feature: OptionalFeature) -> bool {
        self.supported_features
            .as_ref()
            .map(|set| set.contains(&feature))
            .unwrap_or(true)
    }

    /// Validates values that would make estimates meaningless
    pub fn validate(&self) -> CoreResult<()> {
        if self.provider_id.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "Provider id cannot be empty".to_string(),
            ));
        }
        if !self.cost_per_unit.is_finite() || self.cost_per_unit < 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "Provider {} has invalid cost per unit: {}",
                self.provider_id, self.cost_per_unit
            )));
        }
        if !self.max_duration_units.is_finite() || self.max_duration_units <= 0.0 {
            return Err(CoreError::InvalidConfig(format!(
                "Provider {} has invalid max duration: {}",
                self.provider_id, self.max_duration_units
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Capability Filter
// =============================================================================

/// Hard capability constraints: class, duration limit and add-on support
pub struct CapabilityFilter;

impl CapabilityFilter {
    /// Whether `provider` can satisfy the hard constraints of `request`
    pub fn fits(provider: &ProviderConfig, request: &GenerationRequest) -> bool {
        Self::check(provider, request).is_ok()
    }

    /// Same as [`CapabilityFilter::fits`], reporting the first violated constraint
    pub fn check(provider: &ProviderConfig, request: &GenerationRequest) -> Result<(), SkipReason> {
        if provider.capability_class != request.capability_class {
            return Err(SkipReason::CapabilityMismatch {
                provided: provider.capability_class,
                requested: request.capability_class,
            });
        }
        if request.duration_units > provider.max_duration_units {
            return Err(SkipReason::DurationExceeded {
                requested: request.duration_units,
                max: provider.max_duration_units,
            });
        }
        if let Some(feature) = request
            .features
            .iter()
            .copied()
            .find(|f| !provider.supports_feature(*f))
        {
            return Err(SkipReason::FeatureUnsupported { feature });
        }
        Ok(())
    }
}

// =============================================================================
// Provider Backend
// =============================================================================

/// What a backend reports after a generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOutput {
    pub success: bool,
    /// Actual billed cost, which may differ from the estimate
    pub cost: Usd,
    /// Duration actually produced, in duration units
    pub duration_actual: f64,
    /// Location of the produced asset, if the backend exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_uri: Option<String>,
}

impl ProviderOutput {
    pub fn succeeded(cost: Usd, duration_actual: f64) -> Self {
        Self {
            success: true,
            cost,
            duration_actual,
            asset_uri: None,
        }
    }

    pub fn with_asset_uri(mut self, uri: impl Into<String>) -> Self {
        self.asset_uri = Some(uri.into());
        self
    }
}

/// An opaque generation backend. Timeouts are the backend's own concern.
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Runs one generation call for `request`
    async fn invoke(&self, request: &GenerationRequest) -> CoreResult<ProviderOutput>;
}

// ============================================================================
// Scripted Backend for Testing
// ============================================================================

/// Backend that replays queued outcomes and records every request it sees.
/// Once the script is exhausted it keeps succeeding with the default output.
#[derive(Debug)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<CoreResult<ProviderOutput>>>,
    default_output: ProviderOutput,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new(default_output: ProviderOutput) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_output,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Backend that always succeeds with the given cost
    pub fn succeeding(cost: Usd) -> Self {
        Self::new(ProviderOutput::succeeded(cost, 0.0))
    }

    /// Queues a failure for the next call
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.push(Err(CoreError::Backend(message.into())));
        self
    }

    /// Queues a specific outcome for the next call
    pub fn then(self, outcome: CoreResult<ProviderOutput>) -> Self {
        self.push(outcome);
        self
    }

    fn push(&self, outcome: CoreResult<ProviderOutput>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Requests received so far, in call order
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProviderBackend for ScriptedBackend {
    async fn invoke(&self, request: &GenerationRequest) -> CoreResult<ProviderOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(outcome) => outcome,
            None => Ok(ProviderOutput {
                duration_actual: request.duration_units,
                ..self.default_output.clone()
            }),
        }
    }
}
