//! Data models for simulation-service.

mod billing_event;
mod quota;
mod session;

pub use billing_event::{BillingEvent, BillingEventType, WebhookPayload};
pub use quota::{
    CreateLedger, QuotaLedger, QuotaSnapshot, SubscriptionStatus, SubscriptionTier,
    UNLIMITED_SENTINEL,
};
pub use session::{Session, SessionState, SessionType};
