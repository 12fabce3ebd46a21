//! Generative Provider Dispatch
//!
//! Health-aware, capability-filtered, cost-bounded selection of generative
//! backends, and the dispatch flow that ties selection to the budget.

pub mod cost;
pub mod engine;
pub mod health;
pub mod providers;
pub mod request;
pub mod selection;

// Re-export main types
pub use cost::CostEstimator;
pub use engine::{DispatchEngine, DispatchOutcome};
pub use health::{HealthProbe, ProviderHealthCache, ProviderHealthRecord, StaticHealthProbe};
pub use providers::{
    CapabilityFilter, ProviderBackend, ProviderConfig, ProviderOutput, ScriptedBackend,
};
pub use request::{GenerationQuality, GenerationRequest, OptionalFeature, Priority};
pub use selection::{CandidateSkip, Selection, SelectionPolicy, SelectionReason, SkipReason};
