//! Budget Data Models
//!
//! Thresholds, threshold states, spend entries and the per-day budget state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{CoreError, CoreResult, Environment, ServiceName, Usd};

// =============================================================================
// Threshold State
// =============================================================================

/// Threshold state derived from cumulative daily spend
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    #[default]
    Normal,
    Warning,
    Critical,
    Maximum,
}

impl BudgetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetStatus::Normal => "normal",
            BudgetStatus::Warning => "warning",
            BudgetStatus::Critical => "critical",
            BudgetStatus::Maximum => "maximum",
        }
    }

    /// Advisory action for this state. Never enforced by the governor.
    pub fn recommendation(&self) -> Option<&'static str> {
        match self {
            BudgetStatus::Normal => None,
            BudgetStatus::Warning => Some("Enable caching and reduce generation frequency"),
            BudgetStatus::Critical => Some("Switch to degraded or mock mode"),
            BudgetStatus::Maximum => Some("Block all generation calls until the daily reset"),
        }
    }

    /// Whether crossing into this state raises an alert
    pub fn is_alerting(&self) -> bool {
        *self != BudgetStatus::Normal
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Daily spend thresholds for one environment, in USD
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSet {
    pub environment: Environment,
    pub warning: Usd,
    pub critical: Usd,
    pub maximum: Usd,
}

impl ThresholdSet {
    /// Builds a validated threshold set
    pub fn new(
        environment: Environment,
        warning: Usd,
        critical: Usd,
        maximum: Usd,
    ) -> CoreResult<Self> {
        let set = Self {
            environment,
            warning,
            critical,
            maximum,
        };
        set.validate()?;
        Ok(set)
    }

    /// Built-in thresholds per environment
    pub fn defaults_for(environment: Environment) -> Self {
        let (warning, critical, maximum) = match environment {
            Environment::Development => (1.0, 2.0, 5.0),
            Environment::Staging => (5.0, 10.0, 25.0),
            Environment::Production => (20.0, 50.0, 100.0),
        };
        Self {
            environment,
            warning,
            critical,
            maximum,
        }
    }

    /// Requires `0 <= warning < critical < maximum`, all finite
    pub fn validate(&self) -> CoreResult<()> {
        let values = [self.warning, self.critical, self.maximum];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "Thresholds for {} must be finite and non-negative",
                self.environment
            )));
        }
        if !(self.warning < self.critical && self.critical < self.maximum) {
            return Err(CoreError::InvalidConfig(format!(
                "Thresholds for {} must increase: warning {} < critical {} < maximum {}",
                self.environment, self.warning, self.critical, self.maximum
            )));
        }
        Ok(())
    }

    /// Threshold state for a daily total. Boundaries are inclusive.
    pub fn status_for(&self, total: Usd) -> BudgetStatus {
        if total >= self.maximum {
            BudgetStatus::Maximum
        } else if total >= self.critical {
            BudgetStatus::Critical
        } else if total >= self.warning {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Normal
        }
    }

    /// Amount at which `status` begins
    pub fn threshold_for(&self, status: BudgetStatus) -> Usd {
        match status {
            BudgetStatus::Normal => 0.0,
            BudgetStatus::Warning => self.warning,
            BudgetStatus::Critical => self.critical,
            BudgetStatus::Maximum => self.maximum,
        }
    }
}

// =============================================================================
// Spend Entries
// =============================================================================

/// One billable operation. Totals are filled in by the governor on record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEntry {
    pub service: ServiceName,
    pub cost: Usd,
    /// RFC 3339 timestamp of the operation; stamped on record when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Environment daily total after this entry
    #[serde(default)]
    pub daily_total: Usd,
    /// Service daily total after this entry
    #[serde(default)]
    pub service_total: Usd,
    pub environment: Environment,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CostEntry {
    pub fn new(environment: Environment, service: impl Into<ServiceName>, cost: Usd) -> Self {
        Self {
            service: service.into(),
            cost,
            timestamp: None,
            daily_total: 0.0,
            service_total: 0.0,
            environment,
            metadata: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_metadata<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }
}

// =============================================================================
// Daily State
// =============================================================================

/// Dedup key for threshold alerts: at most one per level per day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertKey {
    pub level: BudgetStatus,
    pub date: NaiveDate,
}

/// Live spend state of one environment for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBudgetState {
    pub environment: Environment,
    /// Day this state accumulates (UTC)
    pub date: NaiveDate,
    /// Always equal to the sum of `per_service_spend`
    pub daily_spend_total: Usd,
    pub per_service_spend: BTreeMap<ServiceName, Usd>,
    pub alerts_sent_today: BTreeSet<AlertKey>,
    /// Entries recorded today, in order
    #[serde(default)]
    pub entries: Vec<CostEntry>,
}

impl DailyBudgetState {
    pub fn new(environment: Environment, date: NaiveDate) -> Self {
        Self {
            environment,
            date,
            daily_spend_total: 0.0,
            per_service_spend: BTreeMap::new(),
            alerts_sent_today: BTreeSet::new(),
            entries: Vec::new(),
        }
    }

    /// Adds `cost` to `service` and returns the new (daily, service) totals
    pub(crate) fn add(&mut self, service: &str, cost: Usd) -> (Usd, Usd) {
        let service_total = {
            let slot = self.per_service_spend.entry(service.to_string()).or_insert(0.0);
            *slot += cost;
            *slot
        };
        self.daily_spend_total = self.per_service_spend.values().sum();
        (self.daily_spend_total, service_total)
    }

    /// Folds a later state of the same day into this one
    pub(crate) fn absorb(&mut self, later: DailyBudgetState) {
        for (service, spend) in later.per_service_spend {
            *self.per_service_spend.entry(service).or_insert(0.0) += spend;
        }
        self.daily_spend_total = self.per_service_spend.values().sum();
        self.alerts_sent_today.extend(later.alerts_sent_today);
        self.entries.extend(later.entries);
    }

    pub fn service_spend(&self, service: &str) -> Usd {
        self.per_service_spend.get(service).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// Governor Results
// =============================================================================

/// Outcome of a non-mutating spend check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preauthorization {
    /// False only when the would-be state is `maximum`
    pub allowed: bool,
    /// State after the estimate would be spent
    pub status: BudgetStatus,
    pub current_status: BudgetStatus,
    pub projected_total: Usd,
    pub recommendation: Option<String>,
}

/// Threshold alert, emitted once per level per day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub environment: Environment,
    pub level: BudgetStatus,
    pub date: NaiveDate,
    pub daily_total: Usd,
    pub threshold: Usd,
    pub recommendation: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl BudgetAlert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            level: self.level,
            date: self.date,
        }
    }
}

/// Outcome of recording spend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    /// The entry with totals filled in
    pub entry: CostEntry,
    pub status: BudgetStatus,
    /// Present only when this record crossed into a not-yet-alerted level
    pub alert: Option<BudgetAlert>,
    pub recommendation: Option<String>,
}

/// Point-in-time view of an environment's budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSummary {
    pub environment: Environment,
    pub date: NaiveDate,
    pub daily_spend_total: Usd,
    pub per_service_spend: BTreeMap<ServiceName, Usd>,
    pub status: BudgetStatus,
    pub thresholds: ThresholdSet,
    /// Share of the maximum threshold consumed (0-100+)
    pub usage_percentage: f64,
    pub recommendation: Option<String>,
}

/// Spend for one past day, as loaded from the persistence sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalSpend {
    pub date: NaiveDate,
    pub total: Usd,
    pub per_service: BTreeMap<ServiceName, Usd>,
}
