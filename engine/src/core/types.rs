//! ReelPilot Core Type Definitions
//!
//! Defines fundamental types shared by the selection and budget subsystems.

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Provider identifier as configured per deployment (e.g. "runway", "pika")
pub type ProviderId = String;

/// Generation request identifier (ULID)
pub type RequestId = String;

/// Billable service name used for spend accounting
pub type ServiceName = String;

/// Amount in US dollars
pub type Usd = f64;

// =============================================================================
// Environment
// =============================================================================

/// Deployment environment; each one carries its own thresholds and daily state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// All environments in ascending order of spend tolerance
    pub const ALL: [Environment; 3] = [
        Environment::Development,
        Environment::Staging,
        Environment::Production,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

// =============================================================================
// Provider Classification
// =============================================================================

/// Category of generation a provider serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    Video,
    Audio,
    Content,
}

impl std::fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityClass::Video => write!(f, "video"),
            CapabilityClass::Audio => write!(f, "audio"),
            CapabilityClass::Content => write!(f, "content"),
        }
    }
}

/// Preference rank of a provider. Primaries are always tried before fallbacks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRank {
    #[default]
    Primary,
    Fallback,
}

impl std::fmt::Display for ProviderRank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderRank::Primary => write!(f, "primary"),
            ProviderRank::Fallback => write!(f, "fallback"),
        }
    }
}
