//! Quota ledger model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored `session_limit` value meaning "no limit". Kept out of arithmetic;
/// code works with `Option<i32>` via [`SubscriptionTier::session_limit`].
pub const UNLIMITED_SENTINEL: i32 = -1;

/// Subscription tier. The tier-to-limit mapping lives here so there is a
/// single lookup table for quota sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Standard,
    Plus,
    Unlimited,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Standard => "standard",
            SubscriptionTier::Plus => "plus",
            SubscriptionTier::Unlimited => "unlimited",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "standard" => SubscriptionTier::Standard,
            "plus" => SubscriptionTier::Plus,
            "unlimited" => SubscriptionTier::Unlimited,
            _ => SubscriptionTier::Free,
        }
    }

    /// Countable sessions allowed per billing period. `None` means unlimited.
    pub fn session_limit(&self) -> Option<i32> {
        match self {
            SubscriptionTier::Free => Some(3),
            SubscriptionTier::Standard => Some(10),
            SubscriptionTier::Plus => Some(30),
            SubscriptionTier::Unlimited => None,
        }
    }

    /// Limit as stored in the ledger row.
    pub fn stored_limit(&self) -> i32 {
        self.session_limit().unwrap_or(UNLIMITED_SENTINEL)
    }
}

/// Provider subscription state mirrored onto the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "cancelled" => SubscriptionStatus::Cancelled,
            "expired" => SubscriptionStatus::Expired,
            _ => SubscriptionStatus::Active,
        }
    }
}

/// One row per user: tier, limit, consumption, and the current billing window.
///
/// Invariant: `used_count` equals the number of `counted` sessions whose
/// `started_utc` falls inside `[period_start, period_end)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaLedger {
    pub user_id: Uuid,
    pub tier: String,
    pub session_limit: i32,
    pub used_count: i32,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub billing_anchor_day: i32,
    pub subscription_status: String,
    pub provider_subscription_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl QuotaLedger {
    pub fn is_unlimited(&self) -> bool {
        self.session_limit == UNLIMITED_SENTINEL
    }

    pub fn limit(&self) -> Option<i32> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.session_limit)
        }
    }

    pub fn is_active(&self) -> bool {
        SubscriptionStatus::from_string(&self.subscription_status) == SubscriptionStatus::Active
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let remaining = self.limit().map(|l| (l - self.used_count).max(0));
        QuotaSnapshot {
            user_id: self.user_id,
            tier: self.tier.clone(),
            used: self.used_count,
            limit: self.limit(),
            remaining,
            is_unlimited: self.is_unlimited(),
            period_start: self.period_start,
            period_end: self.period_end,
        }
    }
}

/// Input for creating (or re-activating) a ledger row.
#[derive(Debug, Clone)]
pub struct CreateLedger {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub billing_anchor_day: i32,
    pub provider_subscription_id: Option<String>,
}

/// Read-only quota view returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: Uuid,
    pub tier: String,
    pub used: i32,
    pub limit: Option<i32>,
    pub remaining: Option<i32>,
    pub is_unlimited: bool,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}
