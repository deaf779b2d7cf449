//! Live session bridged over NATS
//!
//! For deployments where a gateway holds the connection to the live endpoint,
//! the session speaks the same JSON messages over per-session subjects:
//! - `live.setup.<id>`   client → gateway, session setup
//! - `live.input.<id>`   client → gateway, realtime microphone input
//! - `live.close.<id>`   client → gateway, end of session
//! - `live.server.<id>`  gateway → client, server messages

use anyhow::{anyhow, bail, Context, Result};
use async_nats::Client;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::messages::{decode_server_message, realtime_input_message, setup_message};
use super::prompt::SessionSetup;
use super::transport::{LiveConnector, LiveSession, TransportEvent};
use crate::audio::AudioBlob;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

async fn await_setup_complete(subscriber: &mut async_nats::Subscriber) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        if decode_server_message(&msg.payload)?.setup_complete {
            return Ok(());
        }
    }
    bail!("Gateway closed the subscription during setup")
}

#[async_trait::async_trait]
impl LiveConnector for NatsConnector {
    async fn connect(
        &self,
        setup: SessionSetup,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn LiveSession>> {
        info!("Connecting to NATS at {}", self.url);

        let client = async_nats::connect(self.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let server_subject = format!("live.server.{}", session_id);

        let mut subscriber = client
            .subscribe(server_subject.clone())
            .await
            .context("Failed to subscribe to server messages")?;

        let payload = serde_json::to_vec(&setup_message(&setup))?;
        client
            .publish(format!("live.setup.{}", session_id), payload.into())
            .await
            .context("Failed to publish session setup")?;

        tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut subscriber))
            .await
            .context("Timed out waiting for session setup")??;

        info!("Live session {} open via {}", session_id, server_subject);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<AudioBlob>();

        let publisher = client.clone();
        let input_subject = format!("live.input.{}", session_id);
        let writer = tokio::spawn(async move {
            while let Some(blob) = outbound_rx.recv().await {
                let payload = match serde_json::to_vec(&realtime_input_message(&blob)) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = publisher.publish(input_subject.clone(), payload.into()).await {
                    error!("Failed to publish audio frame: {}", e);
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                match decode_server_message(&msg.payload) {
                    Ok(inbound) => {
                        if events.send(TransportEvent::Message(inbound)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Failed to parse server message: {:#}", e),
                }
            }
            let _ = events.send(TransportEvent::Closed(Some(
                "gateway subscription ended".to_string(),
            )));
        });

        Ok(Arc::new(NatsSession {
            client,
            session_id,
            outbound: Mutex::new(Some(outbound_tx)),
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }
}

struct NatsSession {
    client: Client,
    session_id: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<AudioBlob>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NatsSession {
    fn take_tasks(&self) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks = self.tasks.lock().map_err(|_| anyhow!("task lock poisoned"))?;
        Ok(tasks.drain(..).collect())
    }
}

#[async_trait::async_trait]
impl LiveSession for NatsSession {
    fn send_audio(&self, blob: AudioBlob) -> Result<()> {
        let outbound = self.outbound.lock().map_err(|_| anyhow!("outbound lock poisoned"))?;
        match outbound.as_ref() {
            Some(tx) => tx.send(blob).map_err(|_| anyhow!("Live session is closed")),
            None => bail!("Live session is closed"),
        }
    }

    async fn close(&self) -> Result<()> {
        let was_open = {
            let mut outbound = self.outbound.lock().map_err(|_| anyhow!("outbound lock poisoned"))?;
            outbound.take().is_some()
        };

        for task in self.take_tasks()? {
            task.abort();
        }

        if was_open {
            info!("Closing live session {}", self.session_id);
            self.client
                .publish(format!("live.close.{}", self.session_id), Vec::<u8>::new().into())
                .await
                .context("Failed to publish session close")?;
            self.client.flush().await.context("Failed to flush NATS")?;
        }

        Ok(())
    }
}
