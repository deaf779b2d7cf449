use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::messages::{decode_server_message, realtime_input_message, setup_message};
use super::prompt::SessionSetup;
use super::transport::{LiveConnector, LiveSession, TransportEvent};
use crate::audio::AudioBlob;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Live endpoint reached over a WebSocket
pub struct WebSocketConnector {
    endpoint: String,
    api_key: Option<String>,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
        }
    }

    fn url(&self) -> Result<String> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("API key is not configured"))?;
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.endpoint, separator, key))
    }
}

enum Outbound {
    Audio(AudioBlob),
    Close,
}

fn payload(msg: &Message) -> Option<&[u8]> {
    match msg {
        Message::Text(text) => Some(text.as_bytes()),
        Message::Binary(bytes) => Some(bytes.as_slice()),
        _ => None,
    }
}

async fn await_setup_complete<S>(stream: &mut S) -> Result<()>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = frame.context("Live endpoint error during setup")?;
        if let Message::Close(close) = &frame {
            bail!(
                "Live endpoint closed during setup: {}",
                close.as_ref().map(|c| c.reason.to_string()).unwrap_or_default()
            );
        }
        if let Some(bytes) = payload(&frame) {
            if decode_server_message(bytes)?.setup_complete {
                return Ok(());
            }
        }
    }
    bail!("Live endpoint closed during setup")
}

#[async_trait::async_trait]
impl LiveConnector for WebSocketConnector {
    fn ensure_configured(&self) -> Result<()> {
        self.url().map(|_| ())
    }

    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn LiveSession>> {
        info!("Connecting to live endpoint {}", self.endpoint);

        let (ws, _) = tokio_tungstenite::connect_async(self.url()?)
            .await
            .context("Failed to connect to live endpoint")?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(setup_message(&setup).to_string()))
            .await
            .context("Failed to send session setup")?;

        // The session is open once the endpoint acknowledges the setup
        tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut stream))
            .await
            .context("Timed out waiting for session setup")??;

        info!("Live session open (model {})", setup.model);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Audio(blob) => {
                        let text = realtime_input_message(&blob).to_string();
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            error!("Failed to send audio frame: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => {
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            debug!("Close frame not sent: {}", e);
                        }
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Close(close)) => {
                        let reason = close
                            .filter(|c| c.code != CloseCode::Normal)
                            .map(|c| format!("{} (code {})", c.reason, u16::from(c.code)));
                        let _ = events.send(TransportEvent::Closed(reason));
                        return;
                    }
                    Ok(frame) => {
                        let Some(bytes) = payload(&frame) else {
                            continue;
                        };
                        match decode_server_message(bytes) {
                            Ok(msg) => {
                                if msg.go_away {
                                    warn!("Live endpoint announced it will close the session");
                                }
                                if events.send(TransportEvent::Message(msg)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Skipping undecodable server message: {:#}", e),
                        }
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed(None));
        });

        Ok(Arc::new(WebSocketSession {
            outbound: outbound_tx,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

struct WebSocketSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl LiveSession for WebSocketSession {
    fn send_audio(&self, blob: AudioBlob) -> Result<()> {
        self.outbound
            .send(Outbound::Audio(blob))
            .map_err(|_| anyhow!("Live session is closed"))
    }

    async fn close(&self) -> Result<()> {
        let _ = self.outbound.send(Outbound::Close);

        let writer = {
            let mut slot = self.writer.lock().map_err(|_| anyhow!("writer lock poisoned"))?;
            slot.take()
        };
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                warn!("Live session writer did not finish in time");
            }
        }

        let reader = {
            let mut slot = self.reader.lock().map_err(|_| anyhow!("reader lock poisoned"))?;
            slot.take()
        };
        if let Some(reader) = reader {
            reader.abort();
        }

        info!("Live session closed");
        Ok(())
    }
}
