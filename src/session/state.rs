use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transcript::ChatTurn;

/// Connection state of the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Everything the rendering layer shows about the session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identifier minted at each `start`
    pub session_id: Option<String>,

    /// Configuration identity the session accrues usage against
    pub config_id: Option<String>,

    pub state: ConnectionState,

    /// When the endpoint opened the session
    pub started_at: Option<DateTime<Utc>>,

    /// Completed turns of the current (or last) session
    pub chat_history: Vec<ChatTurn>,

    /// Live caption of the guest's current utterance
    pub interim_transcript: String,

    /// Last failure message; kept after teardown until the next `start`
    pub session_error: Option<String>,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    /// Seconds since the session opened, if it is open
    pub fn duration_secs(&self) -> Option<f64> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.started_at
            .map(|t| Utc::now().signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
    }
}
