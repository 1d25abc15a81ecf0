//! Database service for simulation-service.
//!
//! All quota-relevant writes are conditional updates or atomic increments so
//! that concurrent callers cannot double-count a session or double-apply a
//! period reset. `used_count` is only ever written by [`Database::count_session`],
//! [`Database::apply_period_reset`], and [`Database::recount_used`].

use crate::models::{BillingEvent, CreateLedger, QuotaLedger, Session, SubscriptionStatus};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, user_id, session_type, client_token, started_utc, ended_utc, duration_seconds, counted, created_utc";
const LEDGER_COLUMNS: &str = "user_id, tier, session_limit, used_count, period_start, period_end, billing_anchor_day, subscription_status, provider_subscription_id, created_utc, updated_utc";

/// Outcome of a check-and-insert session start.
#[derive(Debug)]
pub enum SessionInsert {
    Created(Session),
    /// The client token already exists (idempotent retry).
    DuplicateToken,
    /// The user already has an open session.
    AlreadyOpen,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "simulation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Quota Ledger Operations
    // =========================================================================

    /// Create a ledger row, or re-activate an existing one.
    ///
    /// Replayed `created` events hit the conflict arm, which refreshes tier
    /// and provider linkage but never touches `used_count` or the period;
    /// period changes go exclusively through [`Self::apply_period_reset`].
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn upsert_ledger(&self, input: &CreateLedger) -> Result<QuotaLedger, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_ledger"])
            .start_timer();

        let ledger = sqlx::query_as::<_, QuotaLedger>(&format!(
            r#"
            INSERT INTO quota_ledgers (user_id, tier, session_limit, used_count, period_start, period_end, billing_anchor_day, subscription_status, provider_subscription_id)
            VALUES ($1, $2, $3, 0, $4, $5, $6, 'active', $7)
            ON CONFLICT (user_id) DO UPDATE
            SET tier = EXCLUDED.tier,
                session_limit = EXCLUDED.session_limit,
                subscription_status = 'active',
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                updated_utc = now()
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(input.user_id)
        .bind(input.tier.as_str())
        .bind(input.tier.stored_limit())
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(input.billing_anchor_day)
        .bind(&input.provider_subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to upsert ledger: {}", e)))?;

        timer.observe_duration();
        info!(user_id = %ledger.user_id, tier = %ledger.tier, "Quota ledger upserted");

        Ok(ledger)
    }

    /// Get a user's quota ledger.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_ledger(&self, user_id: Uuid) -> Result<Option<QuotaLedger>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_ledger"])
            .start_timer();

        let ledger = sqlx::query_as::<_, QuotaLedger>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM quota_ledgers WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get ledger: {}", e)))?;

        timer.observe_duration();

        Ok(ledger)
    }

    /// Zero `used_count` and adopt a new billing window, guarded on
    /// `period_start` so a webhook and a concurrent lazy reset cannot both
    /// apply the same period. Returns `None` when the guard rejects the write
    /// (the period was already applied).
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn apply_period_reset(
        &self,
        user_id: Uuid,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
    ) -> Result<Option<QuotaLedger>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_period_reset"])
            .start_timer();

        let ledger = sqlx::query_as::<_, QuotaLedger>(&format!(
            r#"
            UPDATE quota_ledgers
            SET used_count = 0, period_start = $2, period_end = $3, updated_utc = now()
            WHERE user_id = $1 AND period_start < $2
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(new_start)
        .bind(new_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to reset period: {}", e)))?;

        timer.observe_duration();

        if let Some(ref l) = ledger {
            info!(
                user_id = %l.user_id,
                period_start = %l.period_start,
                period_end = %l.period_end,
                "Billing period reset applied"
            );
        }

        Ok(ledger)
    }

    /// Update the mirrored provider subscription status.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn set_subscription_status(
        &self,
        user_id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<Option<QuotaLedger>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_subscription_status"])
            .start_timer();

        let ledger = sqlx::query_as::<_, QuotaLedger>(&format!(
            r#"
            UPDATE quota_ledgers
            SET subscription_status = $2, updated_utc = now()
            WHERE user_id = $1
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set subscription status: {}", e))
        })?;

        timer.observe_duration();

        Ok(ledger)
    }

    /// Recompute `used_count` from the session log and overwrite on mismatch.
    ///
    /// The overwrite is guarded on the previously observed value so it loses
    /// cleanly to a concurrent counting transaction. Returns the
    /// `(stored, actual)` pair when drift was found and repaired.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn recount_used(&self, user_id: Uuid) -> Result<Option<(i32, i64)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recount_used"])
            .start_timer();

        let row: Option<(i32, i64)> = sqlx::query_as(
            r#"
            SELECT ql.used_count,
                   (SELECT COUNT(*) FROM sessions s
                    WHERE s.user_id = ql.user_id
                      AND s.counted = TRUE
                      AND s.started_utc >= ql.period_start
                      AND s.started_utc < ql.period_end)
            FROM quota_ledgers ql
            WHERE ql.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to recount usage: {}", e)))?;

        let result = match row {
            Some((stored, actual)) if i64::from(stored) != actual => {
                sqlx::query(
                    r#"
                    UPDATE quota_ledgers
                    SET used_count = $2, updated_utc = now()
                    WHERE user_id = $1 AND used_count = $3
                    "#,
                )
                .bind(user_id)
                .bind(actual as i32)
                .bind(stored)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to repair usage count: {}", e))
                })?;
                Some((stored, actual))
            }
            _ => None,
        };

        timer.observe_duration();

        Ok(result)
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Get a session by its client idempotency token.
    #[instrument(skip(self))]
    pub async fn get_session_by_token(&self, token: &str) -> Result<Option<Session>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_session_by_token"])
            .start_timer();

        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE client_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get session: {}", e)))?;

        timer.observe_duration();

        Ok(session)
    }

    /// Insert a new open session with a server-side start timestamp.
    ///
    /// Both guards are unique indexes so the check-and-insert is atomic: the
    /// token index catches idempotent retries, the partial open-session index
    /// rejects a second concurrent session for the same user.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn insert_session(
        &self,
        user_id: Uuid,
        session_type: &str,
        token: &str,
    ) -> Result<SessionInsert, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_session"])
            .start_timer();

        let session_id = Uuid::new_v4();
        let result = sqlx::query_as::<_, Session>(&format!(
            r#"
            INSERT INTO sessions (session_id, user_id, session_type, client_token)
            VALUES ($1, $2, $3, $4)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(user_id)
        .bind(session_type)
        .bind(token)
        .fetch_one(&self.pool)
        .await;

        timer.observe_duration();

        match result {
            Ok(session) => {
                info!(session_id = %session.session_id, user_id = %user_id, "Session started");
                Ok(SessionInsert::Created(session))
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                match db_err.constraint() {
                    Some("sessions_one_open_per_user") => Ok(SessionInsert::AlreadyOpen),
                    _ => Ok(SessionInsert::DuplicateToken),
                }
            }
            Err(e) => Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert session: {}",
                e
            ))),
        }
    }

    /// Mark a session counted and consume one unit of quota, exactly once.
    ///
    /// The conditional `counted = FALSE` update decides the winner among
    /// concurrent callers; the ledger increment is atomic arithmetic and is
    /// attributed to the period containing `started_utc`, so a session whose
    /// period rolled over mid-flight does not consume the new period's quota.
    /// Returns whether this call flipped the flag.
    #[instrument(skip(self), fields(session_id = %session_id, user_id = %user_id))]
    pub async fn count_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        started_utc: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["count_session"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let flipped = sqlx::query(
            "UPDATE sessions SET counted = TRUE WHERE session_id = $1 AND counted = FALSE",
        )
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark counted: {}", e)))?
        .rows_affected()
            == 1;

        if flipped {
            let incremented = sqlx::query(
                r#"
                UPDATE quota_ledgers
                SET used_count = used_count + 1, updated_utc = now()
                WHERE user_id = $1 AND period_start <= $2 AND period_end > $2
                "#,
            )
            .bind(user_id)
            .bind(started_utc)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to increment usage: {}", e))
            })?
            .rows_affected();

            if incremented == 0 {
                // Session belongs to a period that has already rolled over;
                // the flag still flips but the current window is untouched.
                info!(
                    session_id = %session_id,
                    user_id = %user_id,
                    "Counted session outside the current billing window"
                );
            }
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(flipped)
    }

    /// Close a session, conditional on it still being open. Returns `None`
    /// when another caller already closed it.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn close_session(
        &self,
        session_id: Uuid,
        ended_utc: DateTime<Utc>,
        duration_seconds: i32,
    ) -> Result<Option<Session>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["close_session"])
            .start_timer();

        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions
            SET ended_utc = GREATEST($2, started_utc), duration_seconds = $3
            WHERE session_id = $1 AND ended_utc IS NULL
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(session_id)
        .bind(ended_utc)
        .bind(duration_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to close session: {}", e)))?;

        timer.observe_duration();

        if let Some(ref s) = session {
            info!(
                session_id = %s.session_id,
                duration_seconds = duration_seconds,
                counted = s.counted,
                "Session closed"
            );
        }

        Ok(session)
    }

    /// Find open sessions started before the cutoff, oldest first.
    #[instrument(skip(self))]
    pub async fn find_orphan_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Session>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_orphan_sessions"])
            .start_timer();

        let sessions = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE ended_utc IS NULL AND started_utc < $1
            ORDER BY started_utc
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find orphans: {}", e)))?;

        timer.observe_duration();

        Ok(sessions)
    }

    // =========================================================================
    // Billing Event Operations
    // =========================================================================

    /// Record a provider event id. Called only after the event's effect has
    /// been applied, so an existing row always means a fully processed
    /// delivery. Returns `false` when a concurrent delivery recorded it first.
    #[instrument(skip(self, payload), fields(event_id = %payload.event_id))]
    pub async fn record_billing_event(
        &self,
        payload: &crate::models::WebhookPayload,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_billing_event"])
            .start_timer();

        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_events (event_id, provider_subscription_id, user_id, event_type, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&payload.event_id)
        .bind(&payload.subscription_id)
        .bind(payload.user_id)
        .bind(&payload.event_type)
        .bind(payload.period_start)
        .bind(payload.period_end)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record billing event: {}", e))
        })?
        .rows_affected()
            == 1;

        timer.observe_duration();

        Ok(inserted)
    }

    /// Get a recorded billing event by id.
    #[instrument(skip(self))]
    pub async fn get_billing_event(&self, event_id: &str) -> Result<Option<BillingEvent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_event"])
            .start_timer();

        let event = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT event_id, provider_subscription_id, user_id, event_type, period_start, period_end, received_utc
            FROM billing_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get billing event: {}", e))
        })?;

        timer.observe_duration();

        Ok(event)
    }
}
