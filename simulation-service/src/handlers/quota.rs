//! Quota query handler.

use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::QuotaSnapshot;
use crate::startup::AppState;

/// Read-only quota snapshot for a user.
pub async fn get_quota(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<QuotaSnapshot>, AppError> {
    let ledger = state
        .db
        .get_ledger(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("No quota ledger for user")))?;

    Ok(Json(ledger.snapshot()))
}
