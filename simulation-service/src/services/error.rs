use service_core::error::AppError;
use thiserror::Error;

/// Domain errors for the session lifecycle and quota paths.
///
/// Idempotency conditions (duplicate token, already counted, already closed)
/// are deliberately not represented here; they return current state instead.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found")]
    SessionNotFound,

    #[error("No quota ledger for user")]
    LedgerNotFound,

    #[error("Session has not reached the countable threshold ({remaining_seconds}s remaining)")]
    TooEarly { remaining_seconds: i64 },

    #[error("Simulation quota exhausted for the current billing period")]
    QuotaExceeded,

    #[error("Another session is already open for this user")]
    ConcurrentSessionActive,

    #[error("Unknown session type: {0}")]
    UnknownSessionType(String),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::SessionNotFound => {
                AppError::NotFound(anyhow::anyhow!("Session not found"))
            }
            SessionError::LedgerNotFound => {
                AppError::NotFound(anyhow::anyhow!("No quota ledger for user"))
            }
            SessionError::TooEarly { remaining_seconds } => AppError::BadRequest(anyhow::anyhow!(
                "Session has not reached the countable threshold ({}s remaining)",
                remaining_seconds
            )),
            SessionError::QuotaExceeded => AppError::Forbidden(anyhow::anyhow!(
                "Simulation quota exhausted for the current billing period"
            )),
            SessionError::ConcurrentSessionActive => AppError::Conflict(anyhow::anyhow!(
                "Another session is already open for this user"
            )),
            SessionError::UnknownSessionType(s) => {
                AppError::BadRequest(anyhow::anyhow!("Unknown session type: {}", s))
            }
            SessionError::Storage(e) => e,
        }
    }
}
