//! ReelPilot Error Definitions
//!
//! Defines error types used throughout the core.

use thiserror::Error;

use super::budget::BudgetStatus;
use super::generative::CandidateSkip;
use super::{Environment, ProviderId, RequestId, Usd};

/// Core engine error types
#[derive(Error, Debug)]
pub enum CoreError {
    // =========================================================================
    // Request Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Selection Errors
    // =========================================================================
    #[error("No eligible provider for request {request_id}: {}", format_skips(.skipped))]
    NoEligibleProvider {
        request_id: RequestId,
        skipped: Vec<CandidateSkip>,
    },

    #[error("Provider not registered: {0}")]
    ProviderNotRegistered(ProviderId),

    // =========================================================================
    // Budget Errors
    // =========================================================================
    #[error(
        "Budget exceeded in {environment}: ${daily_total:.2} spent, \
         ${estimated_cost:.2} requested, maximum ${maximum:.2} (status: {status})"
    )]
    BudgetExceeded {
        environment: Environment,
        status: BudgetStatus,
        daily_total: Usd,
        estimated_cost: Usd,
        maximum: Usd,
    },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("Provider {provider_id} invocation failed: {source}")]
    ProviderInvocation {
        provider_id: ProviderId,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Provider backend error: {0}")]
    Backend(String),

    #[error("Health probe failed: {0}")]
    HealthProbeFailed(String),

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core engine result type
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Wraps a backend failure for the given provider
    pub fn provider_invocation(provider_id: impl Into<ProviderId>, source: CoreError) -> Self {
        CoreError::ProviderInvocation {
            provider_id: provider_id.into(),
            source: Box::new(source),
        }
    }

    /// Whether the dispatcher may answer this error with a degraded retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ProviderInvocation { .. })
    }
}

fn format_skips(skipped: &[CandidateSkip]) -> String {
    if skipped.is_empty() {
        return "no candidates configured".to_string();
    }
    skipped
        .iter()
        .map(|s| format!("{} ({})", s.provider_id, s.reason))
        .collect::<Vec<_>>()
        .join(", ")
}
