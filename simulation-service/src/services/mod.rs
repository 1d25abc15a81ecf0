//! Service layer for simulation-service.

pub mod billing;
pub mod database;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod reconciler;

pub use billing::BillingCycles;
pub use database::{Database, SessionInsert};
pub use error::SessionError;
pub use lifecycle::SessionLifecycle;
pub use metrics::{get_metrics, init_metrics};
pub use reconciler::OrphanReconciler;
