//! Orphan session reconciler.
//!
//! Clients that crash or lose connectivity never call end; their sessions
//! stay open forever. This maintenance pass closes them through the same
//! lifecycle path a client close takes, so the counting rule is applied in
//! exactly one place, then re-derives `used_count` from the session log for
//! every touched user to repair any drift.

use crate::config::ReconcilerConfig;
use crate::services::database::Database;
use crate::services::lifecycle::{CountTrigger, SessionLifecycle};
use crate::services::metrics;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Summary of a single reconciliation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcilePass {
    pub examined: usize,
    pub closed: usize,
    pub counted: usize,
    pub drift_repaired: usize,
}

pub struct OrphanReconciler {
    db: Arc<Database>,
    lifecycle: Arc<SessionLifecycle>,
    interval: std::time::Duration,
    stale_after: Duration,
    batch_size: i64,
}

impl OrphanReconciler {
    pub fn new(
        db: Arc<Database>,
        lifecycle: Arc<SessionLifecycle>,
        config: &ReconcilerConfig,
    ) -> Self {
        Self {
            db,
            lifecycle,
            interval: std::time::Duration::from_secs(config.interval_seconds),
            stale_after: Duration::seconds(config.stale_after_seconds),
            batch_size: config.batch_size,
        }
    }

    /// Run forever on a fixed interval. Intended to be spawned as a
    /// background task at startup.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            interval_seconds = self.interval.as_secs(),
            stale_after_seconds = self.stale_after.num_seconds(),
            "Orphan reconciler started"
        );

        loop {
            ticker.tick().await;
            match self.reconcile_once(Utc::now()).await {
                Ok(pass) if pass.examined > 0 => {
                    info!(
                        examined = pass.examined,
                        closed = pass.closed,
                        counted = pass.counted,
                        drift_repaired = pass.drift_repaired,
                        "Reconciliation pass completed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Reconciliation pass failed, will retry on next tick");
                }
            }
        }
    }

    /// One reconciliation pass as of `now`.
    ///
    /// A session concurrently closed by its owning client simply shows up as
    /// an already-closed replay inside the lifecycle path; the conditional
    /// guards make that a no-op rather than a double count.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcilePass, AppError> {
        let cutoff = now - self.stale_after;
        let orphans = self.db.find_orphan_sessions(cutoff, self.batch_size).await?;

        let mut pass = ReconcilePass {
            examined: orphans.len(),
            ..Default::default()
        };
        let mut touched_users: HashSet<Uuid> = HashSet::new();

        for session in &orphans {
            let was_counted = session.counted;
            match self
                .lifecycle
                .close_session_at(session, now, CountTrigger::Reconciler)
                .await
            {
                Ok(outcome) => {
                    pass.closed += 1;
                    touched_users.insert(session.user_id);
                    if outcome.counted && !was_counted {
                        pass.counted += 1;
                        metrics::record_orphan_reclaimed("counted");
                    } else {
                        metrics::record_orphan_reclaimed("uncounted");
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        error = %e,
                        "Failed to reconcile orphan session"
                    );
                }
            }
        }

        for user_id in touched_users {
            match self.db.recount_used(user_id).await {
                Ok(Some((stored, actual))) => {
                    pass.drift_repaired += 1;
                    metrics::record_drift_repaired();
                    warn!(
                        user_id = %user_id,
                        stored = stored,
                        actual = actual,
                        "Repaired quota ledger drift"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Failed drift check for user");
                }
            }
        }

        Ok(pass)
    }
}
