//! Session lifecycle handlers.
//!
//! Each operation is idempotent on the client-supplied token: retried
//! requests converge on the same stored state instead of erroring.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Session, SessionState, SessionType};
use crate::services::SessionError;
use crate::startup::AppState;

/// Request to start a new simulation session.
#[derive(Debug, Deserialize, Validate)]
pub struct StartSessionRequest {
    pub user_id: Uuid,
    /// One of `mock_exam`, `practice_exam`.
    pub session_type: String,
    /// Client idempotency key, unique per session attempt.
    #[validate(length(min = 1, max = 128))]
    pub client_token: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub session_type: String,
    pub state: SessionState,
    pub client_token: String,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub counted: bool,
}

impl From<Session> for SessionResponse {
    fn from(s: Session) -> Self {
        Self {
            session_id: s.session_id,
            user_id: s.user_id,
            session_type: s.session_type.clone(),
            state: s.state(),
            client_token: s.client_token.clone(),
            started_utc: s.started_utc,
            ended_utc: s.ended_utc,
            duration_seconds: s.duration_seconds,
            counted: s.counted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CountableResponse {
    pub counted: bool,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub counted: bool,
    pub duration_seconds: i32,
}

/// Start a session. Returns 201 for a new session, 200 when the token
/// replays an existing one.
pub async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    payload.validate()?;

    let session_type = SessionType::parse(&payload.session_type)
        .ok_or_else(|| SessionError::UnknownSessionType(payload.session_type.clone()))
        .map_err(AppError::from)?;

    let outcome = state
        .lifecycle
        .start(payload.user_id, session_type, &payload.client_token)
        .await
        .map_err(AppError::from)?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(SessionResponse::from(outcome.session))))
}

/// Mark a session countable once it has run past the minimum threshold.
pub async fn mark_countable(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<CountableResponse>, AppError> {
    let counted = state
        .lifecycle
        .mark_countable(&token)
        .await
        .map_err(AppError::from)?;

    Ok(Json(CountableResponse { counted }))
}

/// End a session. Replays return the originally stored duration.
pub async fn end_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<EndSessionResponse>, AppError> {
    let outcome = state.lifecycle.end(&token).await.map_err(AppError::from)?;

    Ok(Json(EndSessionResponse {
        counted: outcome.counted,
        duration_seconds: outcome.duration_seconds,
    }))
}
