//! Billing cycle resets.
//!
//! Two triggers, one routine: provider renewal webhooks and the lazy check
//! performed when a user starts a session after their period expired both
//! funnel into [`Database::apply_period_reset`], whose `period_start` guard
//! makes the triggers race-safe. The webhook is a hint; the lazy check is
//! the authority.

use crate::models::{
    BillingEventType, CreateLedger, QuotaLedger, SubscriptionStatus, SubscriptionTier,
    WebhookPayload,
};
use crate::services::database::Database;
use crate::services::metrics;
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use hmac::{Hmac, Mac};
use service_core::error::AppError;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// How a webhook delivery was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// State changed.
    Applied,
    /// Replayed event id or already-applied period; acknowledged, no change.
    Stale,
    /// Event type we do not react to.
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct BillingCycles {
    db: Arc<Database>,
}

impl BillingCycles {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply a verified provider event. Signature verification happens at the
    /// HTTP boundary before this is called.
    #[instrument(skip(self, payload), fields(event_id = %payload.event_id, user_id = %payload.user_id))]
    pub async fn apply_webhook_event(
        &self,
        payload: &WebhookPayload,
    ) -> Result<WebhookOutcome, AppError> {
        let Some(event_type) = BillingEventType::parse(&payload.event_type) else {
            warn!(event_type = %payload.event_type, "Unhandled billing event type");
            metrics::record_webhook_event(&payload.event_type, WebhookOutcome::Ignored.as_str());
            return Ok(WebhookOutcome::Ignored);
        };

        if self.db.get_billing_event(&payload.event_id).await?.is_some() {
            info!(event_id = %payload.event_id, "Replayed billing event, skipping");
            metrics::record_webhook_event(event_type.as_str(), WebhookOutcome::Stale.as_str());
            return Ok(WebhookOutcome::Stale);
        }

        let outcome = match event_type {
            BillingEventType::Created => self.apply_created(payload).await?,
            BillingEventType::Updated => self.apply_renewal(payload).await?,
            BillingEventType::Cancelled => {
                self.db
                    .set_subscription_status(payload.user_id, SubscriptionStatus::Cancelled)
                    .await?;
                WebhookOutcome::Applied
            }
            BillingEventType::Expired => {
                self.db
                    .set_subscription_status(payload.user_id, SubscriptionStatus::Expired)
                    .await?;
                WebhookOutcome::Applied
            }
        };

        // Recorded only after the effect lands, so a delivery that fails
        // partway stays retryable under the same event id. Concurrent
        // duplicates are held off by the period_start guard, not this row.
        self.db.record_billing_event(payload).await?;

        metrics::record_webhook_event(event_type.as_str(), outcome.as_str());
        Ok(outcome)
    }

    /// Provision (or re-activate) a ledger at signup / first subscription.
    async fn apply_created(&self, payload: &WebhookPayload) -> Result<WebhookOutcome, AppError> {
        let (period_start, period_end) = require_period(payload)?;
        let tier = SubscriptionTier::from_string(payload.tier.as_deref().unwrap_or("free"));

        self.db
            .upsert_ledger(&CreateLedger {
                user_id: payload.user_id,
                tier,
                period_start,
                period_end,
                billing_anchor_day: period_start.day() as i32,
                provider_subscription_id: Some(payload.subscription_id.clone()),
            })
            .await?;

        // A re-subscription after lapse arrives as `created` with a fresh
        // window; the conditional reset adopts it on the existing row.
        self.db
            .apply_period_reset(payload.user_id, period_start, period_end)
            .await?;

        Ok(WebhookOutcome::Applied)
    }

    /// A renewal: zero the used counter and adopt the provider's new window.
    async fn apply_renewal(&self, payload: &WebhookPayload) -> Result<WebhookOutcome, AppError> {
        let (period_start, period_end) = require_period(payload)?;

        match self
            .db
            .apply_period_reset(payload.user_id, period_start, period_end)
            .await?
        {
            Some(_) => {
                metrics::record_period_reset("webhook");
                Ok(WebhookOutcome::Applied)
            }
            None => {
                info!(
                    user_id = %payload.user_id,
                    period_start = %period_start,
                    "Billing period already applied, skipping"
                );
                Ok(WebhookOutcome::Stale)
            }
        }
    }

    /// Lazy reset: if the ledger's period has expired and the subscription is
    /// still active, roll the window forward to the one containing `now`.
    ///
    /// This is what keeps quota correct when a renewal webhook is delayed or
    /// dropped. Losing the conditional reset to a concurrent webhook is fine;
    /// the refetched row is authoritative either way.
    #[instrument(skip(self, ledger), fields(user_id = %ledger.user_id))]
    pub async fn ensure_current_period(
        &self,
        ledger: QuotaLedger,
        now: DateTime<Utc>,
    ) -> Result<QuotaLedger, AppError> {
        if now < ledger.period_end || !ledger.is_active() {
            return Ok(ledger);
        }

        let (new_start, new_end) =
            roll_forward(ledger.period_end, ledger.billing_anchor_day as u32, now);

        match self
            .db
            .apply_period_reset(ledger.user_id, new_start, new_end)
            .await?
        {
            Some(updated) => {
                metrics::record_period_reset("lazy");
                Ok(updated)
            }
            None => {
                let refreshed = self.db.get_ledger(ledger.user_id).await?;
                Ok(refreshed.unwrap_or(ledger))
            }
        }
    }
}

fn require_period(payload: &WebhookPayload) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
    match (payload.period_start, payload.period_end) {
        (Some(s), Some(e)) if e > s => Ok((s, e)),
        _ => Err(AppError::BadRequest(anyhow::anyhow!(
            "Billing event {} is missing a valid period",
            payload.event_id
        ))),
    }
}

/// Verify the provider's HMAC-SHA256 hex signature over the raw body,
/// constant-time.
pub fn verify_webhook_signature(secret: &str, body: &str, signature: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.len() != signature.len() {
        return false;
    }
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Sign a webhook body the way the provider does. Used by tests and local
/// tooling to produce valid deliveries.
pub fn sign_webhook_body(secret: &str, body: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Advance a period boundary by one billing month, anchored to the user's
/// subscription anniversary day. Short months clamp to their last day without
/// losing the anchor (Jan 31 -> Feb 28 -> Mar 31).
pub fn advance_one_month(ts: DateTime<Utc>, anchor_day: u32) -> DateTime<Utc> {
    let date = ts.date_naive();
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };

    let day = anchor_day.clamp(1, days_in_month(year, month));
    let next = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(date);

    next.and_hms_opt(ts.hour(), ts.minute(), ts.second())
        .unwrap_or_else(|| next.and_hms_opt(0, 0, 0).unwrap_or_default())
        .and_utc()
}

/// Compute the billing window containing `now`, starting from an expired
/// `period_end`. Advances whole months so a user who skipped several cycles
/// lands in the correct window, not the first missed one.
pub fn roll_forward(
    period_end: DateTime<Utc>,
    anchor_day: u32,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut start = period_end;
    let mut end = advance_one_month(start, anchor_day);
    while end <= now {
        start = end;
        end = advance_one_month(start, anchor_day);
    }
    (start, end)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
