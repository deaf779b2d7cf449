//! Live conversation session
//!
//! This module provides the `SessionController` that coordinates:
//! - Microphone capture and framing toward the live endpoint
//! - Playback scheduling of synthesized audio
//! - Transcript aggregation into chat turns
//! - Session and daily quota enforcement
//! - Connection state published to the rendering layer

mod config;
mod controller;
mod state;

pub use config::SessionConfig;
pub use controller::{ControllerDeps, SessionController, SessionHandle, StartOutcome};
pub use state::{ConnectionState, SessionSnapshot};
