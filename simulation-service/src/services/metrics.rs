//! Metrics module for simulation-service.
//! Provides Prometheus metrics for session lifecycle and quota operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Encoder, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "simulation_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Sessions started counter
pub static SESSIONS_STARTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sessions counted against quota, by trigger
pub static SESSIONS_COUNTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Session starts denied on quota
pub static QUOTA_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing period resets, by trigger
pub static PERIOD_RESETS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Provider webhook events, by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Orphaned sessions closed by the reconciler
pub static ORPHANS_RECLAIMED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Ledger drift repairs performed by the reconciler
pub static LEDGER_DRIFT_REPAIRED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    SESSIONS_STARTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_sessions_started_total",
                "Total sessions started by session type"
            ),
            &["session_type"]
        )
        .expect("Failed to register SESSIONS_STARTED_TOTAL")
    });

    SESSIONS_COUNTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_sessions_counted_total",
                "Sessions counted against quota, by counting trigger"
            ),
            &["trigger"]
        )
        .expect("Failed to register SESSIONS_COUNTED_TOTAL")
    });

    QUOTA_DENIALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_quota_denials_total",
                "Session starts denied because the quota was exhausted"
            ),
            &["tier"]
        )
        .expect("Failed to register QUOTA_DENIALS_TOTAL")
    });

    PERIOD_RESETS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_period_resets_total",
                "Billing period resets by trigger"
            ),
            &["trigger"]
        )
        .expect("Failed to register PERIOD_RESETS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_webhook_events_total",
                "Billing provider webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    ORPHANS_RECLAIMED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "simulation_orphans_reclaimed_total",
                "Orphaned sessions closed by the reconciler"
            ),
            &["outcome"]
        )
        .expect("Failed to register ORPHANS_RECLAIMED_TOTAL")
    });

    LEDGER_DRIFT_REPAIRED_TOTAL.get_or_init(|| {
        register_int_counter!(opts!(
            "simulation_ledger_drift_repaired_total",
            "Ledger rows whose used_count was recomputed from the session log"
        ))
        .expect("Failed to register LEDGER_DRIFT_REPAIRED_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Record a session start.
pub fn record_session_started(session_type: &str) {
    if let Some(counter) = SESSIONS_STARTED_TOTAL.get() {
        counter.with_label_values(&[session_type]).inc();
    }
}

/// Record a session counted against quota.
pub fn record_session_counted(trigger: &str) {
    if let Some(counter) = SESSIONS_COUNTED_TOTAL.get() {
        counter.with_label_values(&[trigger]).inc();
    }
}

/// Record a quota denial.
pub fn record_quota_denial(tier: &str) {
    if let Some(counter) = QUOTA_DENIALS_TOTAL.get() {
        counter.with_label_values(&[tier]).inc();
    }
}

/// Record a billing period reset.
pub fn record_period_reset(trigger: &str) {
    if let Some(counter) = PERIOD_RESETS_TOTAL.get() {
        counter.with_label_values(&[trigger]).inc();
    }
}

/// Record a webhook event outcome.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

/// Record an orphan reclaimed by the reconciler.
pub fn record_orphan_reclaimed(outcome: &str) {
    if let Some(counter) = ORPHANS_RECLAIMED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a ledger drift repair.
pub fn record_drift_repaired() {
    if let Some(counter) = LEDGER_DRIFT_REPAIRED_TOTAL.get() {
        counter.inc();
    }
}
