//! Provider Health Cache
//!
//! Cached per-provider health with asymmetric TTLs: failed checks expire
//! quickly so recovery is noticed fast, successful checks live longer so a
//! flapping provider is not re-probed on every request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::settings::{HealthSettings, MAX_HEALTH_TTL_SECS};
use crate::core::{CoreError, CoreResult, ProviderId};

/// Health check capability for one provider
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns `Ok(())` when the provider can currently accept work
    async fn probe(&self, provider_id: &str) -> CoreResult<()>;
}

/// Result of the latest health check for a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthRecord {
    pub provider_id: ProviderId,
    pub healthy: bool,
    pub last_checked_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub cache_expires_at: DateTime<Utc>,
}

impl ProviderHealthRecord {
    /// Whether the record may still be served without a re-check
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.cache_expires_at
    }
}

/// Shared health cache. Concurrent refreshes of the same provider may both
/// probe; the last result stored wins.
pub struct ProviderHealthCache {
    records: RwLock<HashMap<ProviderId, ProviderHealthRecord>>,
    probes: RwLock<HashMap<ProviderId, Arc<dyn HealthProbe>>>,
    clock: Arc<dyn Clock>,
    success_ttl: Duration,
    failure_ttl: Duration,
    probe_timeout: StdDuration,
}

/// Capped so `checked_at + ttl` stays in range for any configured value
fn ttl(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_HEALTH_TTL_SECS) as i64)
}

impl ProviderHealthCache {
    pub fn new(settings: &HealthSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            probes: RwLock::new(HashMap::new()),
            clock,
            success_ttl: ttl(settings.success_ttl_secs),
            failure_ttl: ttl(settings.failure_ttl_secs),
            probe_timeout: StdDuration::from_secs(settings.probe_timeout_secs),
        }
    }

    /// Cache with default TTLs on the system clock
    pub fn with_defaults() -> Self {
        Self::new(&HealthSettings::default(), Arc::new(SystemClock))
    }

    /// Registers (or replaces) the probe used for `provider_id`
    pub async fn register_probe(
        &self,
        provider_id: impl Into<ProviderId>,
        probe: Arc<dyn HealthProbe>,
    ) {
        let provider_id = provider_id.into();
        self.probes.write().await.insert(provider_id.clone(), probe);
        // A new probe must not inherit a verdict from the old one.
        self.records.write().await.remove(&provider_id);
    }

    /// Returns the provider's health, probing when nothing fresh is cached
    pub async fn get_health(&self, provider_id: &str) -> ProviderHealthRecord {
        let now = self.clock.now();
        if let Some(record) = self.records.read().await.get(provider_id) {
            if record.is_fresh(now) {
                return record.clone();
            }
        }

        let record = self.refresh(provider_id).await;
        self.records
            .write()
            .await
            .insert(provider_id.to_string(), record.clone());
        record
    }

    /// Drops the cached record so the next lookup probes again
    pub async fn invalidate(&self, provider_id: &str) {
        self.records.write().await.remove(provider_id);
    }

    /// All cached records, including expired ones
    pub async fn snapshot(&self) -> Vec<ProviderHealthRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        records
    }

    async fn refresh(&self, provider_id: &str) -> ProviderHealthRecord {
        let probe = self.probes.read().await.get(provider_id).cloned();

        let outcome = match probe {
            Some(probe) => {
                match tokio::time::timeout(self.probe_timeout, probe.probe(provider_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(CoreError::Timeout(format!(
                        "health probe exceeded {}s",
                        self.probe_timeout.as_secs()
                    ))),
                }
            }
            None => Err(CoreError::HealthProbeFailed(
                "no health probe registered".to_string(),
            )),
        };

        let checked_at = self.clock.now();
        match outcome {
            Ok(()) => {
                debug!("Provider {} healthy", provider_id);
                ProviderHealthRecord {
                    provider_id: provider_id.to_string(),
                    healthy: true,
                    last_checked_at: checked_at,
                    error_message: None,
                    cache_expires_at: checked_at + self.success_ttl,
                }
            }
            Err(e) => {
                warn!("Provider {} failed health check: {}", provider_id, e);
                ProviderHealthRecord {
                    provider_id: provider_id.to_string(),
                    healthy: false,
                    last_checked_at: checked_at,
                    error_message: Some(e.to_string()),
                    cache_expires_at: checked_at + self.failure_ttl,
                }
            }
        }
    }
}

// ============================================================================
// Static Probe for Testing
// ============================================================================

/// Probe with a switchable verdict that counts how often it ran
#[derive(Debug)]
pub struct StaticHealthProbe {
    healthy: AtomicBool,
    probes: AtomicUsize,
}

impl StaticHealthProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn unhealthy() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticHealthProbe {
    async fn probe(&self, provider_id: &str) -> CoreResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::HealthProbeFailed(format!(
                "{} is unavailable",
                provider_id
            )))
        }
    }
}
