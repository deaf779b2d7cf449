//! HTTP API server for external control (front desk tablet, kiosk shell)
//!
//! This module provides a REST API over the single live session:
//! - POST /session/start - Start a conversation for a property
//! - POST /session/stop - End the conversation
//! - GET /session - Query session status
//! - GET /session/history - Get completed chat turns
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
