//! Generation Request Types
//!
//! Requests supplied by the content source, plus normalization and the
//! degraded variant used by the single retry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::{CapabilityClass, CoreError, CoreResult, Environment, RequestId, Usd};

// =============================================================================
// Enums
// =============================================================================

/// Quality tier requested from the backend
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum GenerationQuality {
    /// Fastest, lowest fidelity
    Basic,
    /// Balanced
    #[default]
    Standard,
    /// Highest fidelity
    Premium,
}

impl GenerationQuality {
    /// One tier lower, saturating at `Basic`
    pub fn lowered(self) -> Self {
        match self {
            GenerationQuality::Premium => GenerationQuality::Standard,
            GenerationQuality::Standard | GenerationQuality::Basic => GenerationQuality::Basic,
        }
    }
}

impl std::fmt::Display for GenerationQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationQuality::Basic => write!(f, "Basic"),
            GenerationQuality::Standard => write!(f, "Standard"),
            GenerationQuality::Premium => write!(f, "Premium"),
        }
    }
}

/// Scheduling priority carried through to the backend
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Billable add-ons a request may enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptionalFeature {
    Voiceover,
    Subtitles,
    BackgroundMusic,
    Upscale,
}

impl std::fmt::Display for OptionalFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionalFeature::Voiceover => write!(f, "voiceover"),
            OptionalFeature::Subtitles => write!(f, "subtitles"),
            OptionalFeature::BackgroundMusic => write!(f, "background music"),
            OptionalFeature::Upscale => write!(f, "upscale"),
        }
    }
}

// =============================================================================
// Generation Request
// =============================================================================

/// A single generation request. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub request_id: RequestId,
    /// Topic or prompt supplied by the content source
    pub topic: String,
    pub capability_class: CapabilityClass,
    /// Requested length in duration units (seconds for video/audio)
    pub duration_units: f64,
    /// Hard ceiling for the estimated cost of this request
    pub max_cost: Usd,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub quality: GenerationQuality,
    #[serde(default)]
    pub features: BTreeSet<OptionalFeature>,
    /// Whether a failed invocation may be answered with a degraded retry
    #[serde(default = "default_allow_fallback")]
    pub allow_fallback: bool,
}

fn default_allow_fallback() -> bool {
    true
}

/// Fallback cost ceiling for requests built with [`GenerationRequest::new`]
pub const DEFAULT_MAX_COST: Usd = 1.0;

impl GenerationRequest {
    /// Creates a request with a fresh ULID and defaults
    pub fn new(
        topic: impl Into<String>,
        capability_class: CapabilityClass,
        duration_units: f64,
    ) -> Self {
        Self {
            request_id: ulid::Ulid::new().to_string(),
            topic: topic.into(),
            capability_class,
            duration_units,
            max_cost: DEFAULT_MAX_COST,
            priority: Priority::default(),
            environment: Environment::default(),
            quality: GenerationQuality::default(),
            features: BTreeSet::new(),
            allow_fallback: true,
        }
    }

    pub fn with_max_cost(mut self, max_cost: Usd) -> Self {
        self.max_cost = max_cost;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quality(mut self, quality: GenerationQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_feature(mut self, feature: OptionalFeature) -> Self {
        self.features.insert(feature);
        self
    }

    pub fn with_allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    /// Validates the request and returns a cleaned copy
    pub fn normalized(&self) -> CoreResult<Self> {
        let topic = self.topic.trim();
        if topic.is_empty() {
            return Err(CoreError::InvalidRequest("Topic cannot be empty".to_string()));
        }
        if self.request_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "Request id cannot be empty".to_string(),
            ));
        }
        validate_duration(self.duration_units)?;
        if !self.max_cost.is_finite() || self.max_cost < 0.0 {
            return Err(CoreError::InvalidRequest(format!(
                "Invalid cost ceiling: {}",
                self.max_cost
            )));
        }

        let mut normalized = self.clone();
        normalized.topic = topic.to_string();
        normalized.request_id = self.request_id.trim().to_string();
        Ok(normalized)
    }

    /// Builds the reduced request used for the single degraded retry:
    /// duration capped at `duration_ceiling`, cost ceiling scaled by
    /// `cost_factor`, quality one tier lower.
    pub fn degraded(&self, duration_ceiling: f64, cost_factor: f64) -> Self {
        let mut degraded = self.clone();
        degraded.duration_units = self.duration_units.min(duration_ceiling);
        degraded.max_cost = self.max_cost * cost_factor;
        degraded.quality = self.quality.lowered();
        degraded
    }
}

/// Rejects durations that cannot be billed
pub(crate) fn validate_duration(duration_units: f64) -> CoreResult<()> {
    if !duration_units.is_finite() || duration_units <= 0.0 {
        return Err(CoreError::InvalidRequest(format!(
            "Duration must be positive, got {}",
            duration_units
        )));
    }
    Ok(())
}
