//! End-to-end scenarios across health, selection, budget and dispatch.

use std::sync::Arc;

use chrono::{Duration, NaiveDate};

use crate::core::budget::{BudgetGovernor, BudgetStatus, CostEntry, ThresholdSet};
use crate::core::clock::ManualClock;
use crate::core::generative::{
    CapabilityFilter, CostEstimator, DispatchEngine, GenerationRequest, ProviderConfig,
    ProviderHealthCache, ScriptedBackend, SelectionPolicy, SelectionReason, StaticHealthProbe,
};
use crate::core::persistence::MemoryStore;
use crate::core::settings::{BudgetSettings, EngineSettings, HealthSettings};
use crate::core::{CapabilityClass, CoreError, Environment};

fn clock() -> ManualClock {
    ManualClock::at_date(NaiveDate::from_ymd_opt(2026, 3, 14).unwrap())
}

fn engine(clock: &ManualClock) -> DispatchEngine {
    DispatchEngine::from_settings(
        &EngineSettings::default(),
        Arc::new(clock.clone()),
        Some(Arc::new(MemoryStore::new())),
    )
}

// ============================================================================
// Selection Scenarios
// ============================================================================

#[tokio::test]
async fn test_unhealthy_primary_falls_back() {
    let clock = clock();
    let engine = engine(&clock);
    engine
        .register_provider(
            ProviderConfig::new("runway", CapabilityClass::Video, 0.5, 600.0),
            Arc::new(ScriptedBackend::succeeding(0.4)),
            StaticHealthProbe::unhealthy(),
        )
        .await
        .unwrap();
    engine
        .register_provider(
            ProviderConfig::new("pika", CapabilityClass::Video, 0.5, 600.0).as_fallback(),
            Arc::new(ScriptedBackend::succeeding(0.4)),
            StaticHealthProbe::healthy(),
        )
        .await
        .unwrap();

    let outcome = engine
        .dispatch(GenerationRequest::new("volcanoes", CapabilityClass::Video, 60.0))
        .await
        .unwrap();

    assert_eq!(outcome.provider_id, "pika");
    assert_eq!(outcome.reason, SelectionReason::FallbackPrimaryUnhealthy);
    assert_eq!(outcome.skipped.len(), 1);
    assert_eq!(outcome.skipped[0].provider_id, "runway");
}

#[tokio::test]
async fn test_long_request_falls_back_on_duration() {
    let clock = clock();
    let engine = engine(&clock);
    let probe = StaticHealthProbe::healthy();
    engine
        .register_provider(
            ProviderConfig::new("runway", CapabilityClass::Video, 0.1, 300.0),
            Arc::new(ScriptedBackend::succeeding(0.5)),
            probe.clone(),
        )
        .await
        .unwrap();
    engine
        .register_provider(
            ProviderConfig::new("pika", CapabilityClass::Video, 0.1, 600.0).as_fallback(),
            Arc::new(ScriptedBackend::succeeding(0.5)),
            probe,
        )
        .await
        .unwrap();

    let outcome = engine
        .dispatch(GenerationRequest::new("deep sea", CapabilityClass::Video, 400.0))
        .await
        .unwrap();

    assert_eq!(outcome.provider_id, "pika");
    assert_eq!(outcome.reason, SelectionReason::FallbackDurationExceeded);
    assert_eq!(outcome.reason.as_str(), "fallback_duration_exceeded");
}

#[tokio::test]
async fn test_health_recovers_after_short_ttl() {
    let clock = clock();
    let cache = ProviderHealthCache::new(&HealthSettings::default(), Arc::new(clock.clone()));
    let probe = StaticHealthProbe::unhealthy();
    cache.register_probe("runway", probe.clone()).await;

    assert!(!cache.get_health("runway").await.healthy);

    probe.set_healthy(true);
    clock.advance(Duration::seconds(30));
    assert!(cache.get_health("runway").await.healthy);
}

#[tokio::test]
async fn test_selection_respects_hard_filters_across_requests() {
    let clock = clock();
    let cache = Arc::new(ProviderHealthCache::new(
        &HealthSettings::default(),
        Arc::new(clock),
    ));
    let candidates = vec![
        ProviderConfig::new("a", CapabilityClass::Video, 2.0, 90.0),
        ProviderConfig::new("b", CapabilityClass::Audio, 0.1, 600.0),
        ProviderConfig::new("c", CapabilityClass::Video, 0.3, 900.0).as_fallback(),
        ProviderConfig::new("d", CapabilityClass::Content, 0.0, 10.0).as_fallback(),
    ];
    for (i, candidate) in candidates.iter().enumerate() {
        cache
            .register_probe(
                candidate.provider_id.clone(),
                Arc::new(StaticHealthProbe::new(i != 2)),
            )
            .await;
    }
    let policy = SelectionPolicy::new(cache, CostEstimator::default());

    for class in [
        CapabilityClass::Video,
        CapabilityClass::Audio,
        CapabilityClass::Content,
    ] {
        for duration in [5.0, 60.0, 120.0, 800.0] {
            for max_cost in [0.01, 0.2, 1.0, 10.0] {
                let request =
                    GenerationRequest::new("t", class, duration).with_max_cost(max_cost);
                if let Ok(selection) = policy.select(&candidates, &request).await {
                    assert!(CapabilityFilter::fits(&selection.provider, &request));
                    assert!(selection.estimated_cost <= request.max_cost);
                    assert_ne!(selection.provider.provider_id, "c");
                }
            }
        }
    }
}

// ============================================================================
// Budget Scenarios
// ============================================================================

#[tokio::test]
async fn test_spend_crosses_into_critical_with_one_alert() {
    let clock = clock();
    let mut settings = BudgetSettings::default();
    settings.thresholds.insert(
        Environment::Staging,
        ThresholdSet::new(Environment::Staging, 1.0, 2.0, 5.0).unwrap(),
    );
    let governor = BudgetGovernor::new(Environment::Staging, &settings, Arc::new(clock), None);
    let mut alerts = governor.subscribe();

    governor
        .record(CostEntry::new(Environment::Staging, "video", 1.50))
        .await
        .unwrap();
    let outcome = governor
        .record(CostEntry::new(Environment::Staging, "audio", 0.60))
        .await
        .unwrap();

    assert!((outcome.entry.daily_total - 2.10).abs() < 1e-9);
    assert_eq!(outcome.status, BudgetStatus::Critical);
    assert_eq!(governor.status().await, BudgetStatus::Critical);

    let mut critical = 0;
    while let Ok(alert) = alerts.try_recv() {
        if alert.level == BudgetStatus::Critical {
            critical += 1;
        }
    }
    assert_eq!(critical, 1);
}

#[tokio::test]
async fn test_daily_totals_always_match_recorded_costs() {
    let clock = clock();
    let governor = BudgetGovernor::new(
        Environment::Production,
        &BudgetSettings::default(),
        Arc::new(clock.clone()),
        None,
    );

    let costs = [0.25, 1.1, 0.05, 3.0, 0.6, 0.0, 2.2];
    let services = ["video", "audio", "content"];
    let mut expected = 0.0;
    for (i, cost) in costs.iter().enumerate() {
        expected += cost;
        governor
            .record(CostEntry::new(
                Environment::Production,
                services[i % services.len()],
                *cost,
            ))
            .await
            .unwrap();

        let state = governor.current_state().await;
        assert!((state.daily_spend_total - expected).abs() < 1e-9);
        let by_service: f64 = state.per_service_spend.values().sum();
        assert!((state.daily_spend_total - by_service).abs() < 1e-9);
    }

    clock.advance(Duration::days(1));
    let archived = governor.reset_daily().await;
    assert!((archived.daily_spend_total - expected).abs() < 1e-9);
    assert_eq!(governor.current_state().await.daily_spend_total, 0.0);
    assert!(governor.history(archived.date).await.is_some());
}

// ============================================================================
// Dispatch Scenarios
// ============================================================================

#[tokio::test]
async fn test_single_failure_is_retried_degraded() {
    let clock = clock();
    let engine = engine(&clock);
    let backend = Arc::new(ScriptedBackend::succeeding(0.3).then_fail("upstream 502"));
    engine
        .register_provider(
            ProviderConfig::new("runway", CapabilityClass::Video, 0.5, 300.0),
            backend.clone(),
            StaticHealthProbe::healthy(),
        )
        .await
        .unwrap();

    let request = GenerationRequest::new("glaciers", CapabilityClass::Video, 90.0);
    let outcome = engine.dispatch(request.clone()).await.unwrap();

    assert_eq!(backend.call_count(), 2);
    assert!(outcome.degraded);
    assert_eq!(outcome.request_id, request.request_id);

    let calls = backend.calls();
    assert!(calls[1].duration_units < calls[0].duration_units);
    assert!(calls[1].max_cost < calls[0].max_cost);
    assert_eq!(engine.budget().daily_total().await, 0.3);
}

#[tokio::test]
async fn test_second_failure_propagates_original_error() {
    let clock = clock();
    let engine = engine(&clock);
    let backend = Arc::new(
        ScriptedBackend::succeeding(0.3)
            .then_fail("first failure")
            .then_fail("second failure"),
    );
    engine
        .register_provider(
            ProviderConfig::new("runway", CapabilityClass::Video, 0.5, 300.0),
            backend.clone(),
            StaticHealthProbe::healthy(),
        )
        .await
        .unwrap();

    let err = engine
        .dispatch(GenerationRequest::new("glaciers", CapabilityClass::Video, 90.0))
        .await
        .unwrap_err();

    match &err {
        CoreError::ProviderInvocation { provider_id, source } => {
            assert_eq!(provider_id, "runway");
            assert!(source.to_string().contains("first failure"));
        }
        other => panic!("Expected ProviderInvocation, got {:?}", other),
    }
    assert_eq!(backend.call_count(), 2);
    assert_eq!(engine.budget().daily_total().await, 0.0);
    assert!(engine.history(10).await.is_empty());
}

#[tokio::test]
async fn test_dispatch_drives_budget_to_block() {
    let clock = clock();
    let engine = engine(&clock);
    let backend = Arc::new(ScriptedBackend::succeeding(1.2));
    engine
        .register_provider(
            ProviderConfig::new("runway", CapabilityClass::Video, 0.5, 300.0),
            backend.clone(),
            StaticHealthProbe::healthy(),
        )
        .await
        .unwrap();
    let mut alerts = engine.budget().subscribe();

    let mut served = 0;
    let blocked = loop {
        match engine
            .dispatch(GenerationRequest::new("dunes", CapabilityClass::Video, 60.0))
            .await
        {
            Ok(_) => served += 1,
            Err(e) => break e,
        }
        assert!(served < 10);
    };

    // 1.2 per call against development thresholds {1, 2, 5}
    assert_eq!(served, 4);
    assert!(matches!(blocked, CoreError::BudgetExceeded { .. }));
    assert_eq!(backend.call_count(), 4);

    let mut levels = Vec::new();
    while let Ok(alert) = alerts.try_recv() {
        levels.push(alert.level);
    }
    assert_eq!(levels, vec![BudgetStatus::Warning, BudgetStatus::Critical]);

    clock.advance(Duration::days(1));
    engine.budget().reset_daily().await;
    assert!(engine
        .dispatch(GenerationRequest::new("dunes", CapabilityClass::Video, 60.0))
        .await
        .is_ok());
}
