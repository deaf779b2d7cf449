use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::messages::InboundMessage;
use super::prompt::SessionSetup;
use crate::audio::AudioBlob;

/// Events delivered by an open live session, in transport order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The endpoint reported an error
    Error(String),
    /// The connection closed; `Some` carries the reason of an abnormal close
    Closed(Option<String>),
}

/// Opens live sessions against the remote endpoint
///
/// `connect` resolves once the endpoint has acknowledged the setup, which is
/// the session's "open" moment. Every later delivery goes to `events`.
#[async_trait::async_trait]
pub trait LiveConnector: Send + Sync {
    /// Fails when a credential or setting required to connect is missing
    fn ensure_configured(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn LiveSession>>;
}

/// Handle to an open live session
#[async_trait::async_trait]
pub trait LiveSession: Send + Sync {
    /// Queue an encoded microphone frame for transmission
    fn send_audio(&self, blob: AudioBlob) -> Result<()>;

    /// Close the session; safe to call more than once
    async fn close(&self) -> Result<()>;
}
