//! Provider Selection Policy
//!
//! Picks the provider for a request. Capability and cost are hard filters
//! that are never overridden; health and rank only decide preference among
//! otherwise eligible candidates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::cost::CostEstimator;
use super::health::ProviderHealthCache;
use super::providers::{CapabilityFilter, ProviderConfig};
use super::request::{GenerationRequest, OptionalFeature};
use crate::core::{CapabilityClass, CoreError, CoreResult, ProviderId, ProviderRank, Usd};

// =============================================================================
// Skip Diagnostics
// =============================================================================

/// Why a candidate was passed over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Unhealthy {
        error: Option<String>,
    },
    CapabilityMismatch {
        provided: CapabilityClass,
        requested: CapabilityClass,
    },
    DurationExceeded {
        requested: f64,
        max: f64,
    },
    FeatureUnsupported {
        feature: OptionalFeature,
    },
    OverBudget {
        estimated_cost: Usd,
        max_cost: Usd,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unhealthy { error: Some(error) } => write!(f, "unhealthy: {}", error),
            SkipReason::Unhealthy { error: None } => write!(f, "unhealthy"),
            SkipReason::CapabilityMismatch {
                provided,
                requested,
            } => write!(f, "serves {} but {} was requested", provided, requested),
            SkipReason::DurationExceeded { requested, max } => {
                write!(f, "duration {} exceeds limit {}", requested, max)
            }
            SkipReason::FeatureUnsupported { feature } => {
                write!(f, "{} not supported", feature)
            }
            SkipReason::OverBudget {
                estimated_cost,
                max_cost,
            } => write!(
                f,
                "estimated ${:.2} exceeds ceiling ${:.2}",
                estimated_cost, max_cost
            ),
        }
    }
}

/// A skipped candidate and the reason it was skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSkip {
    pub provider_id: ProviderId,
    pub rank: ProviderRank,
    pub reason: SkipReason,
}

// =============================================================================
// Selection Result
// =============================================================================

/// Why the selected provider won
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    PrimaryHealthy,
    FallbackPrimaryUnhealthy,
    FallbackDurationExceeded,
    FallbackCostOptimization,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::PrimaryHealthy => "primary_healthy",
            SelectionReason::FallbackPrimaryUnhealthy => "fallback_primary_unhealthy",
            SelectionReason::FallbackDurationExceeded => "fallback_duration_exceeded",
            SelectionReason::FallbackCostOptimization => "fallback_cost_optimization",
        }
    }

    /// Reason for choosing a fallback, derived from why the first relevant
    /// primary was skipped. Primaries serving another capability class are
    /// not considered.
    fn for_fallback(skipped: &[CandidateSkip]) -> Self {
        let first_primary = skipped.iter().find(|s| {
            s.rank == ProviderRank::Primary
                && !matches!(s.reason, SkipReason::CapabilityMismatch { .. })
        });

        match first_primary.map(|s| &s.reason) {
            Some(SkipReason::DurationExceeded { .. })
            | Some(SkipReason::FeatureUnsupported { .. }) => {
                SelectionReason::FallbackDurationExceeded
            }
            Some(SkipReason::OverBudget { .. }) => SelectionReason::FallbackCostOptimization,
            Some(SkipReason::Unhealthy { .. })
            | Some(SkipReason::CapabilityMismatch { .. })
            | None => SelectionReason::FallbackPrimaryUnhealthy,
        }
    }
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a successful selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub provider: ProviderConfig,
    pub reason: SelectionReason,
    pub estimated_cost: Usd,
    /// Candidates passed over before the winner
    pub skipped: Vec<CandidateSkip>,
}

// =============================================================================
// Selection Policy
// =============================================================================

/// Health, capability and cost aware provider selection
pub struct SelectionPolicy {
    health: Arc<ProviderHealthCache>,
    estimator: CostEstimator,
}

impl SelectionPolicy {
    pub fn new(health: Arc<ProviderHealthCache>, estimator: CostEstimator) -> Self {
        Self { health, estimator }
    }

    pub fn estimator(&self) -> &CostEstimator {
        &self.estimator
    }

    pub fn health(&self) -> &Arc<ProviderHealthCache> {
        &self.health
    }

    /// Picks the first candidate, primaries first in configured order, that
    /// is healthy, fits the request and stays within `request.max_cost`.
    pub async fn select(
        &self,
        candidates: &[ProviderConfig],
        request: &GenerationRequest,
    ) -> CoreResult<Selection> {
        let mut ordered: Vec<&ProviderConfig> = candidates.iter().collect();
        // Stable sort keeps the configured order within a rank.
        ordered.sort_by_key(|p| p.rank);

        let mut skipped = Vec::new();

        for candidate in ordered {
            match self.evaluate(candidate, request).await? {
                Ok(estimated_cost) => {
                    let reason = match candidate.rank {
                        ProviderRank::Primary => SelectionReason::PrimaryHealthy,
                        ProviderRank::Fallback => SelectionReason::for_fallback(&skipped),
                    };
                    info!(
                        "Selected provider {} for request {} ({}, estimated ${:.2})",
                        candidate.provider_id, request.request_id, reason, estimated_cost
                    );
                    return Ok(Selection {
                        provider: candidate.clone(),
                        reason,
                        estimated_cost,
                        skipped,
                    });
                }
                Err(reason) => {
                    debug!(
                        "Skipping provider {} for request {}: {}",
                        candidate.provider_id, request.request_id, reason
                    );
                    skipped.push(CandidateSkip {
                        provider_id: candidate.provider_id.clone(),
                        rank: candidate.rank,
                        reason,
                    });
                }
            }
        }

        Err(CoreError::NoEligibleProvider {
            request_id: request.request_id.clone(),
            skipped,
        })
    }

    /// Applies the filters in order: health, capability, cost.
    /// The outer error is a malformed request; the inner one a skip.
    async fn evaluate(
        &self,
        candidate: &ProviderConfig,
        request: &GenerationRequest,
    ) -> CoreResult<Result<Usd, SkipReason>> {
        let health = self.health.get_health(&candidate.provider_id).await;
        if !health.healthy {
            return Ok(Err(SkipReason::Unhealthy {
                error: health.error_message,
            }));
        }

        if let Err(reason) = CapabilityFilter::check(candidate, request) {
            return Ok(Err(reason));
        }

        let estimated_cost = self.estimator.estimate(candidate, request)?;
        if estimated_cost > request.max_cost {
            return Ok(Err(SkipReason::OverBudget {
                estimated_cost,
                max_cost: request.max_cost,
            }));
        }

        Ok(Ok(estimated_cost))
    }
}
