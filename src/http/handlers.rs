use super::state::AppState;
use crate::live::PropertyContext;
use crate::session::{ConnectionState, SessionSnapshot, StartOutcome};
use crate::transcript::ChatTurn;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    /// Configuration identity usage is accrued against
    pub config_id: String,

    /// Property details the assistant answers from
    pub property: PropertyContext,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub status: ConnectionState,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub session_id: Option<String>,
    pub config_id: Option<String>,
    pub state: ConnectionState,
    pub interim_transcript: String,
    pub session_error: Option<String>,
    pub turn_count: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

impl From<&SessionSnapshot> for SessionStatusResponse {
    fn from(snapshot: &SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id.clone(),
            config_id: snapshot.config_id.clone(),
            state: snapshot.state,
            interim_transcript: snapshot.interim_transcript.clone(),
            session_error: snapshot.session_error.clone(),
            turn_count: snapshot.chat_history.len(),
            started_at: snapshot.started_at,
            duration_secs: snapshot.duration_secs(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error })).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /session/start
/// Start a conversation; answers once the session is connecting
pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    info!("Start requested for {}", req.config_id);

    match state.session.start(req.property, req.config_id).await {
        Ok(StartOutcome::Started { session_id }) => (
            StatusCode::ACCEPTED,
            Json(StartSessionResponse {
                session_id: session_id.clone(),
                status: ConnectionState::Connecting,
                message: format!("Session {} connecting", session_id),
            }),
        )
            .into_response(),
        Ok(StartOutcome::Ignored(current)) => error_response(
            StatusCode::CONFLICT,
            format!("Session is {:?}; stop it before starting another", current),
        ),
        Ok(StartOutcome::Rejected(err)) if err.is_quota() => {
            error_response(StatusCode::TOO_MANY_REQUESTS, err.to_string())
        }
        Ok(StartOutcome::Rejected(err)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
        Err(e) => {
            error!("Failed to start session: {:#}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to start session: {}", e),
            )
        }
    }
}

/// POST /session/stop
/// End the conversation and release devices
pub async fn stop_session(State(state): State<AppState>) -> impl IntoResponse {
    info!("Stop requested");

    match state.session.stop().await {
        Ok(()) => {
            let snapshot = state.session.snapshot();
            (StatusCode::OK, Json(SessionStatusResponse::from(&snapshot))).into_response()
        }
        Err(e) => {
            error!("Failed to stop session: {:#}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to stop session: {}", e),
            )
        }
    }
}

/// GET /session
pub async fn get_session_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.session.snapshot();
    (StatusCode::OK, Json(SessionStatusResponse::from(&snapshot)))
}

/// GET /session/history
/// Completed turns of the current (or last) conversation
pub async fn get_session_history(State(state): State<AppState>) -> impl IntoResponse {
    let history: Vec<ChatTurn> = state.session.snapshot().chat_history;
    (StatusCode::OK, Json(history))
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
