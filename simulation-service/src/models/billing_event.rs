//! Billing provider event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Provider subscription lifecycle event types we react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    Created,
    Updated,
    Cancelled,
    Expired,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::Created => "created",
            BillingEventType::Updated => "updated",
            BillingEventType::Cancelled => "cancelled",
            BillingEventType::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(BillingEventType::Created),
            "updated" => Some(BillingEventType::Updated),
            "cancelled" => Some(BillingEventType::Cancelled),
            "expired" => Some(BillingEventType::Expired),
            _ => None,
        }
    }
}

/// A processed provider event, stored for idempotency and audit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEvent {
    pub event_id: String,
    pub provider_subscription_id: String,
    pub user_id: Uuid,
    pub event_type: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub received_utc: DateTime<Utc>,
}

/// Wire shape of a provider webhook delivery.
///
/// `period_start`/`period_end` are present on `created` and `updated`
/// (renewal) events; `tier` is present on `created` and plan changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event_id: String,
    pub event_type: String,
    pub user_id: Uuid,
    pub subscription_id: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub period_end: Option<DateTime<Utc>>,
}
