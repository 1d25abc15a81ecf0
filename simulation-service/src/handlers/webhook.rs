//! Billing provider webhook handler.
//!
//! The signature is verified over the raw body before anything is parsed or
//! persisted. Replayed deliveries are acknowledged with 200 so the provider
//! stops retrying; only signature and malformed-payload failures error.

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use serde::Serialize;
use service_core::error::AppError;
use tracing::{info, warn};

use crate::models::WebhookPayload;
use crate::services::billing::verify_webhook_signature;
use crate::startup::AppState;

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub outcome: &'static str,
}

pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            warn!("Missing billing webhook signature header");
            AppError::Unauthorized(anyhow::anyhow!("Missing webhook signature"))
        })?;

    if !verify_webhook_signature(&state.config.billing.webhook_secret, &body, signature) {
        warn!("Invalid billing webhook signature");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid webhook signature"
        )));
    }

    let payload: WebhookPayload = serde_json::from_str(&body).map_err(|e| {
        warn!(error = %e, "Malformed billing webhook payload");
        AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload"))
    })?;

    info!(
        event_id = %payload.event_id,
        event_type = %payload.event_type,
        user_id = %payload.user_id,
        "Processing billing webhook"
    );

    let outcome = state.billing.apply_webhook_event(&payload).await?;

    Ok((
        StatusCode::OK,
        Json(WebhookResponse {
            outcome: outcome.as_str(),
        }),
    ))
}
