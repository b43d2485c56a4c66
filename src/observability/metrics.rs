//! # Metrics
//!
//! Prometheus metrics for monitoring bundle reconciliation.
//!
//! ## Metrics Exposed
//!
//! - `bundle_builds_total` - Total number of completed build passes
//! - `bundle_build_errors_total` - Build pass failures, labelled by phase
//! - `bundle_build_duration_seconds` - Duration of full reconcile passes
//! - `bundle_uploads_total` - Bundles pushed to object storage
//! - `bundle_workers` - Workers currently registered with the pool

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static BUILDS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("bundle_builds_total", "Total number of completed build passes")
        .expect("Failed to create BUILDS_TOTAL metric - this should never happen")
});

static BUILD_ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "bundle_build_errors_total",
            "Build pass failures by phase",
        ),
        &["phase"],
    )
    .expect("Failed to create BUILD_ERRORS_TOTAL metric - this should never happen")
});

static BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "bundle_build_duration_seconds",
            "Duration of full reconcile passes in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("Failed to create BUILD_DURATION metric - this should never happen")
});

static UPLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("bundle_uploads_total", "Bundles pushed to object storage")
        .expect("Failed to create UPLOADS_TOTAL metric - this should never happen")
});

static WORKERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("bundle_workers", "Workers currently registered with the pool")
        .expect("Failed to create WORKERS metric - this should never happen")
});

/// Register all metrics with the process registry. Safe to call once at
/// startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(BUILDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BUILD_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BUILD_DURATION.clone()))?;
    REGISTRY.register(Box::new(UPLOADS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WORKERS.clone()))?;
    Ok(())
}

pub fn increment_builds() {
    BUILDS_TOTAL.inc();
}

pub fn increment_build_errors(phase: &str) {
    BUILD_ERRORS_TOTAL.with_label_values(&[phase]).inc();
}

pub fn observe_build_duration(seconds: f64) {
    BUILD_DURATION.observe(seconds);
}

pub fn increment_uploads() {
    UPLOADS_TOTAL.inc();
}

pub fn set_worker_count(count: i64) {
    WORKERS.set(count);
}
