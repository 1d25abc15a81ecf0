//! Session lifecycle state machine.
//!
//! States: OPEN -> COUNTABLE -> CLOSED, where both OPEN and COUNTABLE may go
//! directly to CLOSED. Every transition is idempotent on the client token and
//! safe under concurrent retries; the single place that decides "does this
//! session count" is [`SessionLifecycle::close_session_at`] together with the
//! conditional update in [`Database::count_session`].
//!
//! All duration arithmetic uses server time. Client-reported elapsed time is
//! never trusted.

use crate::config::QuotaConfig;
use crate::models::{QuotaLedger, Session, SessionType};
use crate::services::billing::BillingCycles;
use crate::services::database::{Database, SessionInsert};
use crate::services::error::SessionError;
use crate::services::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What triggered the counting step, for metrics only.
#[derive(Debug, Clone, Copy)]
pub enum CountTrigger {
    MarkCountable,
    End,
    Reconciler,
}

impl CountTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            CountTrigger::MarkCountable => "mark_countable",
            CountTrigger::End => "end",
            CountTrigger::Reconciler => "reconciler",
        }
    }
}

/// Result of a start call.
#[derive(Debug)]
pub struct StartOutcome {
    pub session: Session,
    /// False when the token replayed an existing session.
    pub created: bool,
}

/// Result of ending (or reconciling) a session.
#[derive(Debug, Clone, Copy)]
pub struct CloseOutcome {
    pub counted: bool,
    pub duration_seconds: i32,
}

#[derive(Clone)]
pub struct SessionLifecycle {
    db: Arc<Database>,
    billing: Arc<BillingCycles>,
    quota: QuotaConfig,
}

impl SessionLifecycle {
    pub fn new(db: Arc<Database>, billing: Arc<BillingCycles>, quota: QuotaConfig) -> Self {
        Self { db, billing, quota }
    }

    /// Open a new session for a user.
    ///
    /// Token replays return the existing session unchanged. The quota guard
    /// and the single-open-session guard are evaluated separately; the lazy
    /// period reset runs first so an expired window never produces a spurious
    /// quota denial.
    #[instrument(skip(self), fields(user_id = %user_id, session_type = %session_type.as_str()))]
    pub async fn start(
        &self,
        user_id: uuid::Uuid,
        session_type: SessionType,
        token: &str,
    ) -> Result<StartOutcome, SessionError> {
        if let Some(existing) = self.db.get_session_by_token(token).await? {
            info!(session_id = %existing.session_id, "Start replayed for existing token");
            return Ok(StartOutcome {
                session: existing,
                created: false,
            });
        }

        let ledger = self
            .db
            .get_ledger(user_id)
            .await?
            .ok_or(SessionError::LedgerNotFound)?;
        let ledger = self.billing.ensure_current_period(ledger, Utc::now()).await?;

        self.check_quota(&ledger)?;

        match self
            .db
            .insert_session(user_id, session_type.as_str(), token)
            .await?
        {
            SessionInsert::Created(session) => {
                metrics::record_session_started(session_type.as_str());
                Ok(StartOutcome {
                    session,
                    created: true,
                })
            }
            SessionInsert::DuplicateToken => {
                // Lost a race against our own retry; the row exists now.
                let session = self
                    .db
                    .get_session_by_token(token)
                    .await?
                    .ok_or(SessionError::SessionNotFound)?;
                Ok(StartOutcome {
                    session,
                    created: false,
                })
            }
            SessionInsert::AlreadyOpen => Err(SessionError::ConcurrentSessionActive),
        }
    }

    /// Mark a session countable once it has reached the minimum duration,
    /// consuming one unit of quota exactly once.
    #[instrument(skip(self))]
    pub async fn mark_countable(&self, token: &str) -> Result<bool, SessionError> {
        let session = self
            .db
            .get_session_by_token(token)
            .await?
            .ok_or(SessionError::SessionNotFound)?;

        if session.counted {
            return Ok(true);
        }
        if session.ended_utc.is_some() {
            // Closed uncounted: end() already made the counting decision.
            return Ok(false);
        }

        let elapsed = (Utc::now() - session.started_utc).num_seconds();
        if elapsed < self.quota.countable_threshold_seconds {
            return Err(SessionError::TooEarly {
                remaining_seconds: self.quota.countable_threshold_seconds - elapsed,
            });
        }

        let newly = self
            .db
            .count_session(session.session_id, session.user_id, session.started_utc)
            .await?;
        if newly {
            metrics::record_session_counted(CountTrigger::MarkCountable.as_str());
        }

        // A losing concurrent caller still observes counted = true.
        Ok(true)
    }

    /// End a session, finalizing its duration. Replays return the stored
    /// duration.
    #[instrument(skip(self))]
    pub async fn end(&self, token: &str) -> Result<CloseOutcome, SessionError> {
        let session = self
            .db
            .get_session_by_token(token)
            .await?
            .ok_or(SessionError::SessionNotFound)?;

        self.close_session_at(&session, Utc::now(), CountTrigger::End)
            .await
    }

    /// Close a session as of `now`: clamp the duration, apply the counting
    /// rule if the session crossed the threshold without being marked, then
    /// conditionally set the end timestamp.
    ///
    /// Shared by `end` and the orphan reconciler so the counting rule lives
    /// in exactly one place. A race with another closer collapses into
    /// returning the winner's stored state.
    pub async fn close_session_at(
        &self,
        session: &Session,
        now: DateTime<Utc>,
        trigger: CountTrigger,
    ) -> Result<CloseOutcome, SessionError> {
        if session.ended_utc.is_some() {
            return Ok(CloseOutcome {
                counted: session.counted,
                duration_seconds: session.duration_seconds.unwrap_or(0),
            });
        }

        let duration_seconds =
            (now - session.started_utc).num_seconds().clamp(0, self.quota.max_session_seconds)
                as i32;

        if !session.counted
            && i64::from(duration_seconds) >= self.quota.countable_threshold_seconds
        {
            // The mark-countable signal never arrived but the session ran
            // long enough; the same conditional increment applies.
            let newly = self
                .db
                .count_session(session.session_id, session.user_id, session.started_utc)
                .await?;
            if newly {
                metrics::record_session_counted(trigger.as_str());
            }
        }

        match self
            .db
            .close_session(session.session_id, now, duration_seconds)
            .await?
        {
            Some(closed) => Ok(CloseOutcome {
                counted: closed.counted,
                duration_seconds: closed.duration_seconds.unwrap_or(duration_seconds),
            }),
            None => {
                // Another caller closed it first; their result stands.
                let winner = self
                    .db
                    .get_session_by_token(&session.client_token)
                    .await?
                    .ok_or(SessionError::SessionNotFound)?;
                Ok(CloseOutcome {
                    counted: winner.counted,
                    duration_seconds: winner.duration_seconds.unwrap_or(0),
                })
            }
        }
    }

    fn check_quota(&self, ledger: &QuotaLedger) -> Result<(), SessionError> {
        if let Some(limit) = ledger.limit() {
            if ledger.used_count >= limit {
                warn!(
                    user_id = %ledger.user_id,
                    tier = %ledger.tier,
                    used = ledger.used_count,
                    limit = limit,
                    "Session start denied: quota exhausted"
                );
                metrics::record_quota_denial(&ledger.tier);
                return Err(SessionError::QuotaExceeded);
            }
        }
        Ok(())
    }
}
