use std::fmt;
use std::time::Duration;

/// Which usage ceiling was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Daily ceiling already exhausted before the session could start
    DailyAtStart,
    /// Daily ceiling crossed while a session was running
    Daily(Duration),
    /// Per-session wall-clock ceiling
    Session(Duration),
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::DailyAtStart => write!(f, "Daily limit reached. Try again tomorrow."),
            QuotaKind::Daily(limit) => {
                write!(f, "Daily limit reached ({} min).", limit.as_secs() / 60)
            }
            QuotaKind::Session(limit) => write!(
                f,
                "Maximum conversation time reached ({} min).",
                limit.as_secs() / 60
            ),
        }
    }
}

/// Failures surfaced to the guest as the session error message
///
/// None of these crash the process: the controller releases every session
/// resource and keeps the rendered message in its snapshot until the next
/// `start`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Missing credential or configuration; no session was attempted
    #[error("{0}")]
    Configuration(String),

    /// A session or daily usage ceiling was reached
    #[error("{0}")]
    QuotaExceeded(QuotaKind),

    /// The remote endpoint reported an error or closed unexpectedly
    #[error("Session error: {0}")]
    Transport(String),

    /// Microphone or audio output setup failed
    #[error("Audio error: {0}")]
    Device(String),
}

impl SessionError {
    pub fn is_quota(&self) -> bool {
        matches!(self, SessionError::QuotaExceeded(_))
    }
}
