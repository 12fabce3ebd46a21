//! Engine Settings
//!
//! Provides persistent engine settings with:
//! - Atomic file writes (temp file + rename)
//! - Tolerant normalization with defaults
//! - Migration support for schema changes
//!
//! Storage location: {data_dir}/engine_settings.json

use std::collections::BTreeMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::budget::ThresholdSet;
use crate::core::generative::{OptionalFeature, ProviderConfig};
use crate::core::{CoreError, CoreResult, Environment, Usd};

/// Settings schema version for migration support
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "engine_settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "engine_settings.json.lock";

/// Longest health cache TTL, in seconds
pub const MAX_HEALTH_TTL_SECS: u64 = 86_400;

/// Returns the default per-user data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reelpilot")
}

// =============================================================================
// Engine Settings
// =============================================================================

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Schema version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// Environment this deployment spends in
    #[serde(default)]
    pub environment: Environment,

    /// Candidate providers, in preference order within each rank
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub cost: CostSettings,

    #[serde(default)]
    pub budget: BudgetSettings,

    #[serde(default)]
    pub dispatch: DispatchSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            environment: Environment::default(),
            providers: Vec::new(),
            health: HealthSettings::default(),
            cost: CostSettings::default(),
            budget: BudgetSettings::default(),
            dispatch: DispatchSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Normalizes settings so persisted state is always usable.
    ///
    /// Corrects bad values instead of failing, so an old or hand-edited file
    /// never prevents the engine from starting.
    pub fn normalize(&mut self) {
        self.version = SETTINGS_VERSION;

        self.providers.retain(|provider| match provider.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping provider {}: {}", provider.provider_id, e);
                false
            }
        });
        let mut seen = std::collections::HashSet::new();
        self.providers.retain(|provider| {
            let first = seen.insert(provider.provider_id.clone());
            if !first {
                warn!("Dropping duplicate provider {}", provider.provider_id);
            }
            first
        });

        self.health.normalize();
        self.cost.normalize();
        self.budget.normalize();
        self.dispatch.normalize();
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Health cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSettings {
    /// How long a successful check is trusted
    #[serde(default = "default_success_ttl")]
    pub success_ttl_secs: u64,

    /// How long a failed check is trusted
    #[serde(default = "default_failure_ttl")]
    pub failure_ttl_secs: u64,

    /// Upper bound on a single probe; overruns count as unhealthy
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            success_ttl_secs: default_success_ttl(),
            failure_ttl_secs: default_failure_ttl(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_success_ttl() -> u64 {
    60
}

fn default_failure_ttl() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

impl HealthSettings {
    pub fn normalize(&mut self) {
        self.success_ttl_secs = self.success_ttl_secs.clamp(1, MAX_HEALTH_TTL_SECS);
        self.failure_ttl_secs = self.failure_ttl_secs.clamp(1, self.success_ttl_secs);
        self.probe_timeout_secs = self.probe_timeout_secs.clamp(1, 300);
    }
}

/// Cost estimation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostSettings {
    /// Duration units covered by one `cost_per_unit` charge
    #[serde(default = "default_units_per_cost_period")]
    pub units_per_cost_period: f64,

    /// Flat price per enabled add-on
    #[serde(default = "default_add_on_costs")]
    pub add_on_costs: BTreeMap<OptionalFeature, Usd>,
}

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            units_per_cost_period: default_units_per_cost_period(),
            add_on_costs: default_add_on_costs(),
        }
    }
}

fn default_units_per_cost_period() -> f64 {
    60.0
}

fn default_add_on_costs() -> BTreeMap<OptionalFeature, Usd> {
    BTreeMap::from([
        (OptionalFeature::Voiceover, 0.05),
        (OptionalFeature::Subtitles, 0.01),
        (OptionalFeature::BackgroundMusic, 0.02),
        (OptionalFeature::Upscale, 0.10),
    ])
}

impl CostSettings {
    pub fn normalize(&mut self) {
        if !self.units_per_cost_period.is_finite() || self.units_per_cost_period <= 0.0 {
            self.units_per_cost_period = default_units_per_cost_period();
        }
        for cost in self.add_on_costs.values_mut() {
            if !cost.is_finite() || *cost < 0.0 {
                *cost = 0.0;
            }
        }
    }
}

/// Budget thresholds and history retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSettings {
    /// Per-environment thresholds; missing environments use built-in defaults
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<Environment, ThresholdSet>,

    /// Days of archived daily state kept in memory (0 keeps everything)
    #[serde(default = "default_history_retention")]
    pub history_retention_days: u32,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            history_retention_days: default_history_retention(),
        }
    }
}

fn default_thresholds() -> BTreeMap<Environment, ThresholdSet> {
    Environment::ALL
        .into_iter()
        .map(|env| (env, ThresholdSet::defaults_for(env)))
        .collect()
}

fn default_history_retention() -> u32 {
    30
}

impl BudgetSettings {
    /// Thresholds for `environment`, falling back to the built-in set
    pub fn thresholds_for(&self, environment: Environment) -> ThresholdSet {
        self.thresholds
            .get(&environment)
            .copied()
            .unwrap_or_else(|| ThresholdSet::defaults_for(environment))
    }

    pub fn normalize(&mut self) {
        for env in Environment::ALL {
            let valid = self
                .thresholds
                .get(&env)
                .is_some_and(|set| set.environment == env && set.validate().is_ok());
            if !valid {
                if self.thresholds.contains_key(&env) {
                    warn!("Invalid thresholds for {}, using defaults", env);
                }
                self.thresholds.insert(env, ThresholdSet::defaults_for(env));
            }
        }
        self.history_retention_days = self.history_retention_days.min(3650);
    }
}

/// Dispatch and degraded retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSettings {
    /// Whether a failed invocation may be retried once in degraded form
    #[serde(default = "default_true")]
    pub degraded_retry_enabled: bool,

    /// Duration cap applied to the degraded request
    #[serde(default = "default_degraded_duration_ceiling")]
    pub degraded_duration_ceiling: f64,

    /// Multiplier applied to the cost ceiling of the degraded request
    #[serde(default = "default_degraded_cost_factor")]
    pub degraded_cost_factor: f64,

    /// Dispatch outcomes kept for inspection
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            degraded_retry_enabled: true,
            degraded_duration_ceiling: default_degraded_duration_ceiling(),
            degraded_cost_factor: default_degraded_cost_factor(),
            max_history: default_max_history(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_degraded_duration_ceiling() -> f64 {
    60.0
}

fn default_degraded_cost_factor() -> f64 {
    0.8
}

fn default_max_history() -> usize {
    100
}

impl DispatchSettings {
    pub fn normalize(&mut self) {
        if !self.degraded_duration_ceiling.is_finite() || self.degraded_duration_ceiling <= 0.0 {
            self.degraded_duration_ceiling = default_degraded_duration_ceiling();
        }
        let factor = self.degraded_cost_factor;
        if !factor.is_finite() || factor <= 0.0 || factor >= 1.0 {
            self.degraded_cost_factor = default_degraded_cost_factor();
        }
        self.max_history = self.max_history.clamp(1, 10_000);
    }
}

// =============================================================================
// Settings Manager
// =============================================================================

/// Loads, saves and resets engine settings in a data directory
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            settings_path: data_dir.as_ref().join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(&self, exclusive: bool, op: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        // The lock file lives next to the settings file.
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Loads settings, returning defaults when the file is missing or corrupt
    pub fn load(&self) -> EngineSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(EngineSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<EngineSettings>(&content).map_err(|e| {
                CoreError::InvalidConfig(format!("Failed to parse settings file: {}", e))
            })?;

            if settings.version < SETTINGS_VERSION {
                info!(
                    "Migrating settings from version {} to {}",
                    settings.version, SETTINGS_VERSION
                );
                settings = self.migrate(settings);
            }

            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                EngineSettings::default()
            }
        }
    }

    /// Normalizes and saves settings atomically; returns what was written
    pub fn save(&self, settings: &EngineSettings) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();

            let content = serde_json::to_string_pretty(&normalized)?;

            let temp_path = self.settings_path.with_extension("json.tmp");
            if temp_path.exists() {
                let _ = fs::remove_file(&temp_path);
            }

            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;

            if cfg!(windows) && self.settings_path.exists() {
                // rename does not overwrite on Windows
                fs::remove_file(&self.settings_path)?;
            }
            fs::rename(&temp_path, &self.settings_path)?;

            info!("Settings saved to {:?}", self.settings_path);
            Ok(normalized)
        })
    }

    /// Deletes the settings file and returns defaults
    pub fn reset(&self) -> CoreResult<EngineSettings> {
        self.with_lock(true, || {
            if self.settings_path.exists() {
                fs::remove_file(&self.settings_path)?;
                info!("Settings file deleted");
            }
            Ok(EngineSettings::default())
        })
    }

    fn migrate(&self, mut settings: EngineSettings) -> EngineSettings {
        settings.version = SETTINGS_VERSION;
        settings
    }
}
