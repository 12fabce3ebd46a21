//! Dispatch Engine
//!
//! Runs one generation request end to end: select a provider, check the
//! budget, invoke the backend, account the actual spend. A failed
//! invocation may be answered with exactly one degraded retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::cost::CostEstimator;
use super::health::{HealthProbe, ProviderHealthCache};
use super::providers::{ProviderBackend, ProviderConfig, ProviderOutput};
use super::request::GenerationRequest;
use super::selection::{CandidateSkip, Selection, SelectionPolicy, SelectionReason};
use crate::core::budget::{BudgetGovernor, BudgetStatus, CostEntry};
use crate::core::clock::Clock;
use crate::core::persistence::PersistenceSink;
use crate::core::settings::{DispatchSettings, EngineSettings};
use crate::core::{CoreError, CoreResult, Environment, ProviderId, RequestId, Usd};

/// Result of a dispatched request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub request_id: RequestId,
    pub provider_id: ProviderId,
    pub reason: SelectionReason,
    /// 0 for the original request, 1 for the degraded retry
    pub attempt: u32,
    pub degraded: bool,
    pub estimated_cost: Usd,
    pub actual_cost: Usd,
    pub duration_actual: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_uri: Option<String>,
    /// Budget state right after the spend was recorded
    pub budget_status: BudgetStatus,
    /// Candidates passed over during selection
    #[serde(default)]
    pub skipped: Vec<CandidateSkip>,
}

/// Provider dispatch for one deployment environment
pub struct DispatchEngine {
    /// Provider configs in configured order
    providers: RwLock<Vec<ProviderConfig>>,
    /// Backends by provider; configs without one are never selected
    backends: RwLock<HashMap<ProviderId, Arc<dyn ProviderBackend>>>,
    policy: SelectionPolicy,
    budget: Arc<BudgetGovernor>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    /// Recent outcomes, oldest first
    history: RwLock<VecDeque<DispatchOutcome>>,
}

impl DispatchEngine {
    /// Creates an engine from its parts with no providers
    pub fn new(
        policy: SelectionPolicy,
        budget: Arc<BudgetGovernor>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            backends: RwLock::new(HashMap::new()),
            policy,
            budget,
            clock,
            settings,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Builds the whole stack from a normalized copy of `settings`.
    /// Configured providers still need a backend via
    /// [`DispatchEngine::attach_backend`].
    pub fn from_settings(
        settings: &EngineSettings,
        clock: Arc<dyn Clock>,
        sink: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        let mut settings = settings.clone();
        settings.normalize();

        let health = Arc::new(ProviderHealthCache::new(&settings.health, Arc::clone(&clock)));
        let policy = SelectionPolicy::new(health, CostEstimator::from_settings(&settings.cost));
        let budget = Arc::new(BudgetGovernor::new(
            settings.environment,
            &settings.budget,
            Arc::clone(&clock),
            sink,
        ));

        let mut engine = Self::new(policy, budget, clock, settings.dispatch);
        *engine.providers.get_mut() = settings.providers;
        engine
    }

    pub fn environment(&self) -> Environment {
        self.budget.environment()
    }

    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    pub fn health(&self) -> &Arc<ProviderHealthCache> {
        self.policy.health()
    }

    // =========================================================================
    // Provider Registry
    // =========================================================================

    /// Registers a provider with its backend and health probe. A provider
    /// with the same id is replaced in place, keeping its position.
    pub async fn register_provider(
        &self,
        config: ProviderConfig,
        backend: Arc<dyn ProviderBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> CoreResult<()> {
        config.validate()?;
        let provider_id = config.provider_id.clone();

        {
            let mut providers = self.providers.write().await;
            match providers.iter_mut().find(|p| p.provider_id == provider_id) {
                Some(existing) => *existing = config,
                None => providers.push(config),
            }
        }
        self.backends
            .write()
            .await
            .insert(provider_id.clone(), backend);
        self.policy.health().register_probe(provider_id.clone(), probe).await;

        info!("Registered provider: {}", provider_id);
        Ok(())
    }

    /// Attaches a backend and probe to a provider that came from settings
    pub async fn attach_backend(
        &self,
        provider_id: &str,
        backend: Arc<dyn ProviderBackend>,
        probe: Arc<dyn HealthProbe>,
    ) -> CoreResult<()> {
        let known = self
            .providers
            .read()
            .await
            .iter()
            .any(|p| p.provider_id == provider_id);
        if !known {
            return Err(CoreError::ProviderNotRegistered(provider_id.to_string()));
        }

        self.backends
            .write()
            .await
            .insert(provider_id.to_string(), backend);
        self.policy.health().register_probe(provider_id, probe).await;

        info!("Attached backend to provider: {}", provider_id);
        Ok(())
    }

    /// All provider configs in configured order
    pub async fn providers(&self) -> Vec<ProviderConfig> {
        self.providers.read().await.clone()
    }

    async fn candidates(&self) -> Vec<ProviderConfig> {
        let backends = self.backends.read().await;
        self.providers
            .read()
            .await
            .iter()
            .filter(|p| backends.contains_key(&p.provider_id))
            .cloned()
            .collect()
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatches a request. On a provider failure the request is retried
    /// once in degraded form when allowed; if that also fails, the original
    /// error is returned.
    pub async fn dispatch(&self, request: GenerationRequest) -> CoreResult<DispatchOutcome> {
        let request = request.normalized()?;
        if request.environment != self.environment() {
            return Err(CoreError::InvalidRequest(format!(
                "Request {} targets {} but this engine dispatches in {}",
                request.request_id,
                request.environment,
                self.environment()
            )));
        }

        let original = match self.attempt(&request, 0).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        if !original.is_retryable() || !self.may_degrade(&request) {
            return Err(original);
        }

        let degraded = request.degraded(
            self.settings.degraded_duration_ceiling,
            self.settings.degraded_cost_factor,
        );
        warn!(
            "Request {} failed ({}), retrying degraded: {} units, ceiling ${:.2}, quality {}",
            request.request_id,
            original,
            degraded.duration_units,
            degraded.max_cost,
            degraded.quality
        );

        match self.attempt(&degraded, 1).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    "Degraded retry for request {} failed: {}",
                    request.request_id, e
                );
                Err(original)
            }
        }
    }

    fn may_degrade(&self, request: &GenerationRequest) -> bool {
        request.allow_fallback && self.settings.degraded_retry_enabled
    }

    async fn attempt(
        &self,
        request: &GenerationRequest,
        attempt: u32,
    ) -> CoreResult<DispatchOutcome> {
        let candidates = self.candidates().await;
        let Selection {
            provider,
            reason,
            estimated_cost,
            skipped,
        } = self.policy.select(&candidates, request).await?;
        let provider_id = provider.provider_id;

        let check = self.budget.preauthorize(&provider_id, estimated_cost).await?;
        if !check.allowed {
            let thresholds = self.budget.thresholds().await;
            return Err(CoreError::BudgetExceeded {
                environment: self.environment(),
                status: check.status,
                daily_total: self.budget.daily_total().await,
                estimated_cost,
                maximum: thresholds.maximum,
            });
        }

        let backend = self
            .backends
            .read()
            .await
            .get(&provider_id)
            .cloned()
            .ok_or_else(|| CoreError::ProviderNotRegistered(provider_id.clone()))?;

        let output = self.invoke(backend.as_ref(), &provider_id, request).await?;

        let actual_cost = if output.cost.is_finite() && output.cost >= 0.0 {
            output.cost
        } else {
            warn!(
                "Provider {} reported invalid cost {}, recording 0",
                provider_id, output.cost
            );
            0.0
        };

        let entry = CostEntry::new(self.environment(), provider_id.clone(), actual_cost)
            .at(self.clock.now())
            .with_metadata("requestId", &request.request_id)
            .with_metadata("attempt", attempt)
            .with_metadata("capability", request.capability_class);
        let recorded = self.budget.record(entry).await?;

        let outcome = DispatchOutcome {
            request_id: request.request_id.clone(),
            provider_id,
            reason,
            attempt,
            degraded: attempt > 0,
            estimated_cost,
            actual_cost,
            duration_actual: output.duration_actual,
            asset_uri: output.asset_uri,
            budget_status: recorded.status,
            skipped,
        };

        info!(
            "Request {} served by {} (estimated ${:.2}, actual ${:.2}, budget {})",
            outcome.request_id,
            outcome.provider_id,
            outcome.estimated_cost,
            outcome.actual_cost,
            outcome.budget_status
        );

        self.add_to_history(outcome.clone()).await;
        Ok(outcome)
    }

    async fn invoke(
        &self,
        backend: &dyn ProviderBackend,
        provider_id: &str,
        request: &GenerationRequest,
    ) -> CoreResult<ProviderOutput> {
        match backend.invoke(request).await {
            Ok(output) if output.success => Ok(output),
            Ok(_) => Err(CoreError::provider_invocation(
                provider_id,
                CoreError::Backend("backend reported an unsuccessful generation".to_string()),
            )),
            Err(e) => Err(CoreError::provider_invocation(provider_id, e)),
        }
    }

    // =========================================================================
    // History
    // =========================================================================

    async fn add_to_history(&self, outcome: DispatchOutcome) {
        let mut history = self.history.write().await;
        history.push_back(outcome);

        while history.len() > self.settings.max_history {
            history.pop_front();
        }
    }

    /// Most recent outcomes first
    pub async fn history(&self, limit: usize) -> Vec<DispatchOutcome> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }
}
