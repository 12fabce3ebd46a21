//! Budget Governor
//!
//! Accumulates daily spend for one environment, derives the threshold state,
//! emits deduplicated alerts and archives each day on reset.
//!
//! `preauthorize` never mutates. `record` and `reset_daily` serialize on the
//! state lock, so concurrent records never lose an increment and a reset
//! never interleaves with a record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::models::{
    AlertKey, BudgetAlert, BudgetStatus, BudgetSummary, CostEntry, DailyBudgetState,
    HistoricalSpend, Preauthorization, RecordOutcome, ThresholdSet,
};
use crate::core::clock::{format_date, Clock, SystemClock};
use crate::core::persistence::PersistenceSink;
use crate::core::settings::BudgetSettings;
use crate::core::{CoreError, CoreResult, Environment, ServiceName, Usd};

/// Capacity of the alert broadcast channel
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Key prefix for daily cost snapshots in the persistence sink
pub const COST_TRACKING_PREFIX: &str = "cost.tracking";

/// Key prefix for runtime threshold overrides in the persistence sink
pub const THRESHOLD_OVERRIDE_PREFIX: &str = "budget.thresholds";

/// Sink key for a cost snapshot: `cost.tracking.<YYYY-MM-DD>.<service|total>`
pub fn cost_tracking_key(date: NaiveDate, segment: &str) -> String {
    format!("{}.{}.{}", COST_TRACKING_PREFIX, format_date(date), segment)
}

/// Sink key for an environment's threshold override
pub fn threshold_override_key(environment: Environment) -> String {
    format!("{}.{}", THRESHOLD_OVERRIDE_PREFIX, environment)
}

/// Daily budget governor for one environment
pub struct BudgetGovernor {
    environment: Environment,
    thresholds: RwLock<ThresholdSet>,
    state: RwLock<DailyBudgetState>,
    history: RwLock<BTreeMap<NaiveDate, DailyBudgetState>>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn PersistenceSink>>,
    alerts: broadcast::Sender<BudgetAlert>,
    history_retention_days: u32,
}

impl BudgetGovernor {
    /// Creates a governor using the configured thresholds for `environment`.
    /// A persisted threshold override in `sink` takes precedence.
    pub fn new(
        environment: Environment,
        settings: &BudgetSettings,
        clock: Arc<dyn Clock>,
        sink: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        let mut thresholds = settings.thresholds_for(environment);
        if let Some(sink) = sink.as_ref() {
            if let Some(stored) = load_threshold_override(sink.as_ref(), environment) {
                info!("Loaded threshold override for {}", environment);
                thresholds = stored;
            }
        }

        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        let today = clock.today();

        Self {
            environment,
            thresholds: RwLock::new(thresholds),
            state: RwLock::new(DailyBudgetState::new(environment, today)),
            history: RwLock::new(BTreeMap::new()),
            clock,
            sink,
            alerts,
            history_retention_days: settings.history_retention_days,
        }
    }

    /// Governor with default settings, system clock and no persistence
    pub fn with_defaults(environment: Environment) -> Self {
        Self::new(
            environment,
            &BudgetSettings::default(),
            Arc::new(SystemClock),
            None,
        )
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Subscribes to threshold alerts emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BudgetAlert> {
        self.alerts.subscribe()
    }

    // =========================================================================
    // Thresholds
    // =========================================================================

    pub async fn thresholds(&self) -> ThresholdSet {
        *self.thresholds.read().await
    }

    /// Replaces the thresholds at runtime. With `persist` the override is
    /// written durably; otherwise it lives only in this process.
    pub async fn set_thresholds(
        &self,
        thresholds: ThresholdSet,
        persist: bool,
    ) -> CoreResult<()> {
        if thresholds.environment != self.environment {
            return Err(CoreError::InvalidConfig(format!(
                "Thresholds for {} cannot be applied to {}",
                thresholds.environment, self.environment
            )));
        }
        thresholds.validate()?;

        *self.thresholds.write().await = thresholds;
        info!(
            "Thresholds for {} set to warning ${:.2} / critical ${:.2} / maximum ${:.2}",
            self.environment, thresholds.warning, thresholds.critical, thresholds.maximum
        );

        if let Some(sink) = self.sink.as_ref() {
            let key = threshold_override_key(self.environment);
            match serde_json::to_value(thresholds) {
                Ok(value) => {
                    if let Err(e) = sink.set_override(&key, value, persist) {
                        warn!("Failed to store threshold override '{}': {}", key, e);
                    }
                }
                Err(e) => warn!("Failed to serialize threshold override: {}", e),
            }
        }
        Ok(())
    }

    // =========================================================================
    // Spend Checks
    // =========================================================================

    /// Checks what the state would become if `estimated_cost` were spent.
    /// Blocks only when that would-be state is `maximum`. Never mutates.
    pub async fn preauthorize(
        &self,
        service: &str,
        estimated_cost: Usd,
    ) -> CoreResult<Preauthorization> {
        validate_amount(estimated_cost, "estimated cost")?;

        let thresholds = *self.thresholds.read().await;
        let current_total = self.state.read().await.daily_spend_total;

        let current_status = thresholds.status_for(current_total);
        let projected_total = current_total + estimated_cost;
        let status = thresholds.status_for(projected_total);
        let allowed = status != BudgetStatus::Maximum;

        if !allowed {
            warn!(
                "Blocked ${:.2} for {} in {}: projected ${:.2} reaches maximum ${:.2}",
                estimated_cost, service, self.environment, projected_total, thresholds.maximum
            );
        } else if status > current_status {
            debug!(
                "Spend of ${:.2} for {} would move {} from {} to {}",
                estimated_cost, service, self.environment, current_status, status
            );
        }

        Ok(Preauthorization {
            allowed,
            status,
            current_status,
            projected_total,
            recommendation: status.recommendation().map(str::to_string),
        })
    }

    /// Adds an entry to today's spend, recomputes the state and emits an
    /// alert when a not-yet-alerted level is reached.
    pub async fn record(&self, entry: CostEntry) -> CoreResult<RecordOutcome> {
        validate_amount(entry.cost, "cost")?;
        if entry.environment != self.environment {
            return Err(CoreError::InvalidRequest(format!(
                "Cost entry for {} recorded against {} governor",
                entry.environment, self.environment
            )));
        }
        if entry.service.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "Cost entry service cannot be empty".to_string(),
            ));
        }

        let thresholds = *self.thresholds.read().await;

        let outcome = {
            let mut state = self.state.write().await;

            let (daily_total, service_total) = state.add(&entry.service, entry.cost);
            let mut entry = entry;
            entry.timestamp.get_or_insert_with(|| self.clock.now());
            entry.daily_total = daily_total;
            entry.service_total = service_total;
            state.entries.push(entry.clone());

            let status = thresholds.status_for(daily_total);
            let alert = if status.is_alerting() {
                let key = AlertKey {
                    level: status,
                    date: state.date,
                };
                // Insert marks the level as alerted for the day.
                state.alerts_sent_today.insert(key).then(|| BudgetAlert {
                    environment: self.environment,
                    level: status,
                    date: state.date,
                    daily_total,
                    threshold: thresholds.threshold_for(status),
                    recommendation: status.recommendation().map(str::to_string),
                    emitted_at: self.clock.now(),
                })
            } else {
                None
            };

            // Written before the lock is released so snapshots land in state order.
            if self.sink.is_some() {
                let history = self.history.read().await;
                self.persist_snapshot(&state, &entry.service, history.get(&state.date));
            }

            RecordOutcome {
                entry,
                status,
                alert,
                recommendation: status.recommendation().map(str::to_string),
            }
        };

        debug!(
            "Recorded ${:.2} for {} in {} (daily ${:.2}, {})",
            outcome.entry.cost,
            outcome.entry.service,
            self.environment,
            outcome.entry.daily_total,
            outcome.status
        );

        if let Some(alert) = outcome.alert.as_ref() {
            warn!(
                "Budget {} reached in {}: ${:.2} spent today (threshold ${:.2}). {}",
                alert.level,
                alert.environment,
                alert.daily_total,
                alert.threshold,
                alert.recommendation.as_deref().unwrap_or_default()
            );
            // No subscribers is fine; the alert is still marked as sent.
            let _ = self.alerts.send(alert.clone());
        }

        Ok(outcome)
    }

    // =========================================================================
    // Daily Reset
    // =========================================================================

    /// Archives the current day under its date and starts a fresh state for
    /// today. Meant to be called once per day boundary by a scheduler.
    ///
    /// A second reset within the same day folds into the existing archive,
    /// and the fresh state keeps that day's alert keys. Returns the archive
    /// for the closed date.
    pub async fn reset_daily(&self) -> DailyBudgetState {
        let today = self.clock.today();

        let archived = {
            let mut state = self.state.write().await;
            let mut fresh = DailyBudgetState::new(self.environment, today);
            if state.date == today {
                fresh.alerts_sent_today = state.alerts_sent_today.clone();
            }
            let closed = std::mem::replace(&mut *state, fresh);

            // Archive while still excluding records.
            let mut history = self.history.write().await;
            let archived = match history.remove(&closed.date) {
                Some(mut earlier) => {
                    earlier.absorb(closed);
                    earlier
                }
                None => closed,
            };
            history.insert(archived.date, archived.clone());
            self.prune_history(&mut history, today);
            archived
        };

        info!(
            "Daily budget reset for {}: archived {} with ${:.2} across {} service(s)",
            self.environment,
            format_date(archived.date),
            archived.daily_spend_total,
            archived.per_service_spend.len()
        );
        archived
    }

    fn prune_history(
        &self,
        history: &mut BTreeMap<NaiveDate, DailyBudgetState>,
        today: NaiveDate,
    ) {
        if self.history_retention_days == 0 {
            return;
        }
        let cutoff = today - Duration::days(self.history_retention_days as i64);
        let before = history.len();
        history.retain(|date, _| *date >= cutoff);
        let pruned = before - history.len();
        if pruned > 0 {
            debug!("Pruned {} archived day(s) older than {}", pruned, cutoff);
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current threshold state
    pub async fn status(&self) -> BudgetStatus {
        let thresholds = *self.thresholds.read().await;
        thresholds.status_for(self.state.read().await.daily_spend_total)
    }

    /// Copy of the live daily state
    pub async fn current_state(&self) -> DailyBudgetState {
        self.state.read().await.clone()
    }

    pub async fn daily_total(&self) -> Usd {
        self.state.read().await.daily_spend_total
    }

    pub async fn summary(&self) -> BudgetSummary {
        let thresholds = *self.thresholds.read().await;
        let state = self.state.read().await;
        let status = thresholds.status_for(state.daily_spend_total);
        let usage_percentage = if thresholds.maximum > 0.0 {
            state.daily_spend_total / thresholds.maximum * 100.0
        } else {
            100.0
        };

        BudgetSummary {
            environment: self.environment,
            date: state.date,
            daily_spend_total: state.daily_spend_total,
            per_service_spend: state.per_service_spend.clone(),
            status,
            thresholds,
            usage_percentage,
            recommendation: status.recommendation().map(str::to_string),
        }
    }

    /// Alert keys already used today
    pub async fn alerts_sent(&self) -> Vec<AlertKey> {
        self.state
            .read()
            .await
            .alerts_sent_today
            .iter()
            .copied()
            .collect()
    }

    /// Archived state for `date`, if it was reset during this process
    pub async fn history(&self, date: NaiveDate) -> Option<DailyBudgetState> {
        self.history.read().await.get(&date).cloned()
    }

    /// Dates with an archived state, oldest first
    pub async fn archived_dates(&self) -> Vec<NaiveDate> {
        self.history.read().await.keys().copied().collect()
    }

    /// Loads a day's persisted spend snapshot from the sink
    pub fn load_history(&self, date: NaiveDate) -> Option<HistoricalSpend> {
        let sink = self.sink.as_ref()?;

        let total = read_amount(sink.as_ref(), &cost_tracking_key(date, "total"))?;
        let services: Vec<ServiceName> = match sink.get(&cost_tracking_key(date, "services")) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("Ignoring malformed service index for {}: {}", date, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load service index for {}: {}", date, e);
                Vec::new()
            }
        };

        let per_service = services
            .into_iter()
            .filter_map(|service| {
                let amount = read_amount(sink.as_ref(), &cost_tracking_key(date, &service))?;
                Some((service, amount))
            })
            .collect();

        Some(HistoricalSpend {
            date,
            total,
            per_service,
        })
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes the day's totals, including any archive already closed for
    /// the same date.
    fn persist_snapshot(
        &self,
        state: &DailyBudgetState,
        service: &str,
        archived: Option<&DailyBudgetState>,
    ) {
        let Some(sink) = self.sink.as_ref() else {
            return;
        };

        let date = state.date;
        let mut service_total = state.service_spend(service);
        let mut daily_total = state.daily_spend_total;
        let mut services: BTreeSet<&ServiceName> = state.per_service_spend.keys().collect();
        if let Some(archived) = archived {
            service_total += archived.service_spend(service);
            daily_total += archived.daily_spend_total;
            services.extend(archived.per_service_spend.keys());
        }

        let writes: [(String, Value); 3] = [
            (cost_tracking_key(date, service), json!(service_total)),
            (cost_tracking_key(date, "total"), json!(daily_total)),
            (cost_tracking_key(date, "services"), json!(services)),
        ];

        for (key, value) in writes {
            if let Err(e) = sink.set_override(&key, value, true) {
                warn!("Failed to persist cost snapshot '{}': {}", key, e);
            }
        }
    }
}

fn validate_amount(amount: Usd, what: &str) -> CoreResult<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(CoreError::InvalidRequest(format!(
            "Invalid {}: {}",
            what, amount
        )));
    }
    Ok(())
}

fn read_amount(sink: &dyn PersistenceSink, key: &str) -> Option<Usd> {
    match sink.get(key) {
        Ok(value) => value.and_then(|v| v.as_f64()),
        Err(e) => {
            warn!("Failed to read '{}': {}", key, e);
            None
        }
    }
}

fn load_threshold_override(
    sink: &dyn PersistenceSink,
    environment: Environment,
) -> Option<ThresholdSet> {
    let key = threshold_override_key(environment);
    let value = match sink.get(&key) {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(e) => {
            warn!("Failed to read threshold override '{}': {}", key, e);
            return None;
        }
    };

    match serde_json::from_value::<ThresholdSet>(value) {
        Ok(set) if set.environment == environment && set.validate().is_ok() => Some(set),
        Ok(_) => {
            warn!("Ignoring invalid threshold override '{}'", key);
            None
        }
        Err(e) => {
            warn!("Ignoring malformed threshold override '{}': {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::persistence::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, d).unwrap()
    }

    fn settings() -> BudgetSettings {
        let mut settings = BudgetSettings::default();
        settings.thresholds.insert(
            Environment::Development,
            ThresholdSet::new(Environment::Development, 1.0, 2.0, 5.0).unwrap(),
        );
        settings
    }

    fn governor() -> (BudgetGovernor, ManualClock, Arc<MemoryStore>) {
        let clock = ManualClock::at_date(day(10));
        let store = Arc::new(MemoryStore::new());
        let governor = BudgetGovernor::new(
            Environment::Development,
            &settings(),
            Arc::new(clock.clone()),
            Some(store.clone()),
        );
        (governor, clock, store)
    }

    fn entry(service: &str, cost: Usd) -> CostEntry {
        CostEntry::new(Environment::Development, service, cost)
    }

    /// Sink whose every operation fails
    struct BrokenSink;

    impl PersistenceSink for BrokenSink {
        fn set_override(&self, _key: &str, _value: Value, _persist: bool) -> CoreResult<()> {
            Err(CoreError::Persistence("disk full".to_string()))
        }

        fn get(&self, _key: &str) -> CoreResult<Option<Value>> {
            Err(CoreError::Persistence("disk full".to_string()))
        }
    }

    /// Sink that stalls the first daily total write
    struct SlowTotalSink {
        inner: MemoryStore,
        stalled: AtomicBool,
    }

    impl PersistenceSink for SlowTotalSink {
        fn set_override(&self, key: &str, value: Value, persist: bool) -> CoreResult<()> {
            if key.ends_with(".total") && !self.stalled.swap(true, Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.set_override(key, value, persist)
        }

        fn get(&self, key: &str) -> CoreResult<Option<Value>> {
            self.inner.get(key)
        }
    }

    // ========================================================================
    // Preauthorization Tests
    // ========================================================================

    #[tokio::test]
    async fn test_preauthorize_does_not_mutate() {
        let (governor, _clock, store) = governor();
        governor.record(entry("video", 0.5)).await.unwrap();
        let before = governor.current_state().await;
        let stored = store.len();

        for _ in 0..5 {
            let check = governor.preauthorize("video", 1.0).await.unwrap();
            assert!(check.allowed);
            assert_eq!(check.status, BudgetStatus::Warning);
            assert_eq!(check.current_status, BudgetStatus::Normal);
        }

        assert_eq!(governor.current_state().await, before);
        assert_eq!(store.len(), stored);
    }

    #[tokio::test]
    async fn test_preauthorize_blocks_only_at_maximum() {
        let (governor, _clock, _store) = governor();
        governor.record(entry("video", 4.0)).await.unwrap();

        let critical = governor.preauthorize("video", 0.5).await.unwrap();
        assert!(critical.allowed);
        assert_eq!(critical.status, BudgetStatus::Critical);

        let blocked = governor.preauthorize("video", 1.0).await.unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.status, BudgetStatus::Maximum);
        assert!(blocked.recommendation.unwrap().contains("Block"));
    }

    #[tokio::test]
    async fn test_preauthorize_rejects_negative_estimate() {
        let (governor, _clock, _store) = governor();
        assert!(matches!(
            governor.preauthorize("video", -1.0).await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    // ========================================================================
    // Record Tests
    // ========================================================================

    #[tokio::test]
    async fn test_record_accumulates_totals() {
        let (governor, _clock, _store) = governor();

        let first = governor.record(entry("video", 0.3)).await.unwrap();
        assert_eq!(first.entry.daily_total, 0.3);
        assert_eq!(first.entry.service_total, 0.3);

        let second = governor.record(entry("audio", 0.2)).await.unwrap();
        assert!((second.entry.daily_total - 0.5).abs() < 1e-9);
        assert_eq!(second.entry.service_total, 0.2);

        let state = governor.current_state().await;
        assert_eq!(state.entries.len(), 2);
        assert_eq!(
            state.daily_spend_total,
            state.per_service_spend.values().sum::<f64>()
        );
    }

    #[tokio::test]
    async fn test_record_stamps_entry_from_clock() {
        let (governor, clock, _store) = governor();
        clock.advance(Duration::hours(5));

        let stamped = governor.record(entry("video", 0.1)).await.unwrap();
        assert_eq!(stamped.entry.timestamp, Some(clock.now()));

        let explicit = clock.now() - Duration::minutes(3);
        let kept = governor
            .record(entry("video", 0.1).at(explicit))
            .await
            .unwrap();
        assert_eq!(kept.entry.timestamp, Some(explicit));

        let state = governor.current_state().await;
        assert_eq!(state.entries[0].timestamp, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_threshold_scenario_emits_single_critical_alert() {
        let (governor, _clock, _store) = governor();
        let mut alerts = governor.subscribe();

        let first = governor.record(entry("video", 1.50)).await.unwrap();
        assert_eq!(first.status, BudgetStatus::Warning);

        let second = governor.record(entry("audio", 0.60)).await.unwrap();
        assert_eq!(second.status, BudgetStatus::Critical);
        assert!((second.entry.daily_total - 2.10).abs() < 1e-9);

        let mut received = Vec::new();
        while let Ok(alert) = alerts.try_recv() {
            received.push(alert);
        }
        let critical: Vec<_> = received
            .iter()
            .filter(|a| a.level == BudgetStatus::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].threshold, 2.0);
    }

    #[tokio::test]
    async fn test_alerts_never_repeat_within_a_day() {
        let (governor, _clock, _store) = governor();
        let mut alerts = governor.subscribe();

        for _ in 0..10 {
            governor.record(entry("video", 0.3)).await.unwrap();
        }

        let mut levels = Vec::new();
        while let Ok(alert) = alerts.try_recv() {
            levels.push(alert.level);
        }
        assert_eq!(levels, vec![BudgetStatus::Warning, BudgetStatus::Critical]);
        assert_eq!(governor.alerts_sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_jump_emits_alert_for_level_reached() {
        let (governor, _clock, _store) = governor();
        let outcome = governor.record(entry("video", 6.0)).await.unwrap();

        assert_eq!(outcome.status, BudgetStatus::Maximum);
        assert_eq!(outcome.alert.unwrap().level, BudgetStatus::Maximum);
    }

    #[tokio::test]
    async fn test_record_rejects_foreign_environment() {
        let (governor, _clock, _store) = governor();
        let foreign = CostEntry::new(Environment::Production, "video", 1.0);

        assert!(matches!(
            governor.record(foreign).await,
            Err(CoreError::InvalidRequest(_))
        ));
        assert_eq!(governor.daily_total().await, 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_records_do_not_lose_increments() {
        let (governor, _clock, _store) = governor();
        let governor = Arc::new(governor);

        let mut handles = Vec::new();
        for i in 0..50 {
            let governor = Arc::clone(&governor);
            let service = if i % 2 == 0 { "video" } else { "audio" };
            handles.push(tokio::spawn(async move {
                governor.record(entry(service, 0.01)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = governor.current_state().await;
        assert_eq!(state.entries.len(), 50);
        assert!((state.daily_spend_total - 0.5).abs() < 1e-9);
        assert!((state.service_spend("video") - 0.25).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_records_racing_reset_land_in_exactly_one_day() {
        let (governor, clock, _store) = governor();
        let governor = Arc::new(governor);
        clock.advance(Duration::days(1));

        let mut handles = Vec::new();
        for i in 0..40 {
            let governor = Arc::clone(&governor);
            let service = if i % 2 == 0 { "video" } else { "audio" };
            handles.push(tokio::spawn(async move {
                governor.record(entry(service, 0.25)).await.unwrap();
            }));
        }
        let resetter = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.reset_daily().await })
        };
        for handle in handles {
            handle.await.unwrap();
        }
        let archived = resetter.await.unwrap();
        let live = governor.current_state().await;

        assert_eq!(archived.date, day(10));
        assert_eq!(live.date, day(11));
        assert_eq!(archived.entries.len() + live.entries.len(), 40);
        assert!((archived.daily_spend_total + live.daily_spend_total - 10.0).abs() < 1e-9);
        for state in [&archived, &live] {
            let by_service: f64 = state.per_service_spend.values().sum();
            assert!((state.daily_spend_total - by_service).abs() < 1e-9);
            let by_entry: f64 = state.entries.iter().map(|e| e.cost).sum();
            assert!((state.daily_spend_total - by_entry).abs() < 1e-9);
        }
    }

    // ========================================================================
    // Reset Tests
    // ========================================================================

    #[tokio::test]
    async fn test_reset_archives_under_previous_date() {
        let (governor, clock, _store) = governor();
        governor.record(entry("video", 1.5)).await.unwrap();
        governor.record(entry("audio", 0.6)).await.unwrap();

        clock.advance(Duration::days(1));
        let archived = governor.reset_daily().await;
        assert_eq!(archived.date, day(10));

        let state = governor.current_state().await;
        assert_eq!(state.date, day(11));
        assert_eq!(state.daily_spend_total, 0.0);
        assert!(state.per_service_spend.is_empty());
        assert!(state.alerts_sent_today.is_empty());

        let history = governor.history(day(10)).await.unwrap();
        assert!((history.daily_spend_total - 2.1).abs() < 1e-9);
        assert_eq!(history.alerts_sent_today.len(), 2);
        assert_eq!(governor.status().await, BudgetStatus::Normal);
    }

    #[tokio::test]
    async fn test_alerts_fire_again_after_reset() {
        let (governor, clock, _store) = governor();
        assert!(governor.record(entry("video", 1.0)).await.unwrap().alert.is_some());

        clock.advance(Duration::days(1));
        governor.reset_daily().await;

        let outcome = governor.record(entry("video", 1.0)).await.unwrap();
        assert_eq!(outcome.alert.unwrap().date, day(11));
    }

    #[tokio::test]
    async fn test_history_retention() {
        let clock = ManualClock::at_date(day(1));
        let mut settings = settings();
        settings.history_retention_days = 2;
        let governor = BudgetGovernor::new(
            Environment::Development,
            &settings,
            Arc::new(clock.clone()),
            None,
        );

        for _ in 0..4 {
            clock.advance(Duration::days(1));
            governor.reset_daily().await;
        }

        assert_eq!(governor.archived_dates().await, vec![day(3), day(4)]);
    }

    #[tokio::test]
    async fn test_same_day_resets_accumulate_in_archive() {
        let (governor, _clock, _store) = governor();

        governor.record(entry("video", 1.0)).await.unwrap();
        governor.reset_daily().await;
        let repeat = governor.record(entry("video", 1.0)).await.unwrap();
        assert_eq!(repeat.status, BudgetStatus::Warning);
        assert!(repeat.alert.is_none());
        governor.reset_daily().await;
        governor.record(entry("audio", 0.25)).await.unwrap();
        let archived = governor.reset_daily().await;

        assert_eq!(archived.date, day(10));
        assert_eq!(archived.entries.len(), 3);
        assert_eq!(archived.service_spend("video"), 2.0);
        assert_eq!(archived.daily_spend_total, 2.25);
        assert_eq!(governor.history(day(10)).await, Some(archived));
        assert_eq!(governor.archived_dates().await, vec![day(10)]);
        assert_eq!(governor.load_history(day(10)).unwrap().total, 2.25);
    }

    // ========================================================================
    // Persistence Tests
    // ========================================================================

    #[tokio::test]
    async fn test_record_persists_snapshot_keys() {
        let (governor, _clock, store) = governor();
        governor.record(entry("video", 1.5)).await.unwrap();
        governor.record(entry("audio", 0.5)).await.unwrap();

        assert_eq!(
            store.get("cost.tracking.2026-04-10.video").unwrap(),
            Some(json!(1.5))
        );
        assert_eq!(
            store.get("cost.tracking.2026-04-10.total").unwrap(),
            Some(json!(2.0))
        );

        let loaded = governor.load_history(day(10)).unwrap();
        assert_eq!(loaded.total, 2.0);
        assert_eq!(loaded.per_service.len(), 2);
        assert_eq!(loaded.per_service["audio"], 0.5);
        assert!(governor.load_history(day(9)).is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let clock = ManualClock::at_date(day(10));
        let governor = BudgetGovernor::new(
            Environment::Development,
            &settings(),
            Arc::new(clock),
            Some(Arc::new(BrokenSink)),
        );

        let outcome = governor.record(entry("video", 0.4)).await.unwrap();
        assert_eq!(outcome.entry.daily_total, 0.4);
        assert!(governor.load_history(day(10)).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_sink_keeps_snapshot_in_step() {
        let clock = ManualClock::at_date(day(10));
        let sink = Arc::new(SlowTotalSink {
            inner: MemoryStore::new(),
            stalled: AtomicBool::new(false),
        });
        let governor = Arc::new(BudgetGovernor::new(
            Environment::Development,
            &settings(),
            Arc::new(clock),
            Some(sink.clone()),
        ));

        let first = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.record(entry("video", 1.0)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = {
            let governor = Arc::clone(&governor);
            tokio::spawn(async move { governor.record(entry("video", 2.0)).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(governor.daily_total().await, 3.0);
        assert_eq!(
            sink.get("cost.tracking.2026-04-10.total").unwrap(),
            Some(json!(3.0))
        );
        assert_eq!(
            sink.get("cost.tracking.2026-04-10.video").unwrap(),
            Some(json!(3.0))
        );
    }

    #[tokio::test]
    async fn test_threshold_override_persisted_and_reloaded() {
        let (governor, clock, store) = governor();
        let custom = ThresholdSet::new(Environment::Development, 0.5, 1.0, 1.5).unwrap();
        governor.set_thresholds(custom, true).await.unwrap();

        assert_eq!(governor.thresholds().await, custom);
        let outcome = governor.record(entry("video", 1.2)).await.unwrap();
        assert_eq!(outcome.status, BudgetStatus::Critical);

        let reloaded = BudgetGovernor::new(
            Environment::Development,
            &settings(),
            Arc::new(clock),
            Some(store),
        );
        assert_eq!(reloaded.thresholds().await, custom);
    }

    #[tokio::test]
    async fn test_set_thresholds_rejects_invalid() {
        let (governor, _clock, _store) = governor();
        let wrong_env = ThresholdSet::defaults_for(Environment::Production);
        assert!(governor.set_thresholds(wrong_env, false).await.is_err());

        let inverted = ThresholdSet {
            environment: Environment::Development,
            warning: 3.0,
            critical: 2.0,
            maximum: 5.0,
        };
        assert!(matches!(
            governor.set_thresholds(inverted, false).await,
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_summary() {
        let (governor, _clock, _store) = governor();
        governor.record(entry("video", 2.5)).await.unwrap();

        let summary = governor.summary().await;
        assert_eq!(summary.status, BudgetStatus::Critical);
        assert!((summary.usage_percentage - 50.0).abs() < 1e-9);
        assert!(summary.recommendation.unwrap().contains("mock"));
        assert_eq!(summary.date, day(10));
    }
}
