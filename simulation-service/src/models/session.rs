//! Session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of exam simulation being run. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    MockExam,
    PracticeExam,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::MockExam => "mock_exam",
            SessionType::PracticeExam => "practice_exam",
        }
    }

    /// Parse a wire value. Unknown values are rejected rather than defaulted
    /// so a typo never silently records the wrong exam kind.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mock_exam" => Some(SessionType::MockExam),
            "practice_exam" => Some(SessionType::PracticeExam),
            _ => None,
        }
    }
}

/// Lifecycle state derived from the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Countable,
    Closed,
}

/// One attempted simulation session. Rows are never deleted, only closed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub session_type: String,
    pub client_token: String,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub counted: bool,
    pub created_utc: DateTime<Utc>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        if self.ended_utc.is_some() {
            SessionState::Closed
        } else if self.counted {
            SessionState::Countable
        } else {
            SessionState::Open
        }
    }
}
