//! Budget Governance Module
//!
//! Daily spend tracking with warning / critical / maximum thresholds.
//! Spend is checked before dispatch (`preauthorize`) and accounted after a
//! successful call (`record`).

mod governor;
pub mod models;

pub use governor::{cost_tracking_key, threshold_override_key, BudgetGovernor};
pub use models::{
    AlertKey, BudgetAlert, BudgetStatus, BudgetSummary, CostEntry, DailyBudgetState,
    HistoricalSpend, Preauthorization, RecordOutcome, ThresholdSet,
};
