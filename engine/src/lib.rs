//! ReelPilot Core Library
//!
//! Provider selection and cost governance for automated AI video production.
//! The library decides which generative backend serves a request (health,
//! capability and cost aware), tracks daily spend per environment, and
//! degrades behavior as the budget is consumed.
//!
//! Content sourcing, provider wire formats, uploads and any UI surface live
//! outside this crate and plug in through the traits in [`core::generative`]
//! and [`core::persistence`].

pub mod core;

use std::path::Path;
use std::sync::OnceLock;

pub use crate::core::{
    budget::{BudgetGovernor, BudgetStatus, CostEntry, ThresholdSet},
    generative::{DispatchEngine, DispatchOutcome, GenerationRequest, ProviderConfig},
    CoreError, CoreResult,
};

// =============================================================================
// Logging
// =============================================================================

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global tracing subscriber.
///
/// Logs go to stdout and, when `log_dir` is given, to a daily-rolling
/// `reelpilot.log` file in that directory. Filtering follows `RUST_LOG`
/// with INFO as the floor. Calling this more than once is a no-op.
pub fn init_logging(log_dir: Option<&Path>) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create log directory {:?}: {}", dir, e);
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(dir, "reelpilot.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Only the first initializer keeps its guard; later writers are dropped
        // together with their subscriber below.
        let _ = LOG_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests, embedding hosts).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
