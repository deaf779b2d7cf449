use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use live_concierge::{
    create_router, AppState, AudioBackendFactory, AudioSource, Config, ConnectionState,
    ControllerDeps, JsonFileUsageStore, LiveConnector, NatsConnector, PropertyContext,
    RenderDevice, SessionController, SessionHandle, StartOutcome, UsageGuard, WebSocketConnector,
};
use live_concierge::config::TransportKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "live-concierge", version, about = "Voice concierge for short-term rental guests")]
struct Cli {
    /// Configuration file (without extension)
    #[arg(long, default_value = "config/live-concierge")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control API
    Serve {
        /// WAV file used as the microphone (silence when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Hold one conversation from the terminal
    Talk {
        /// Property details as a JSON file
        #[arg(long)]
        property: PathBuf,

        /// Configuration identity usage is accrued against
        #[arg(long)]
        config_id: String,

        /// WAV file used as the microphone
        #[arg(long)]
        input: PathBuf,

        /// Where to save the assistant's audio
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Live Concierge v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded config: {}", cfg.service.name);

    match cli.command {
        Command::Serve { input } => {
            let source = input.map(AudioSource::File).unwrap_or(AudioSource::Silence);
            serve(&cfg, build_session(&cfg, source, None)?).await
        }
        Command::Talk {
            property,
            config_id,
            input,
            output,
        } => {
            let session = build_session(&cfg, AudioSource::File(input), output)?;
            talk(session, &property, config_id).await
        }
    }
}

fn build_session(cfg: &Config, source: AudioSource, output: Option<PathBuf>) -> Result<SessionHandle> {
    let connector: Arc<dyn LiveConnector> = match cfg.live.transport {
        TransportKind::Websocket => {
            info!("Live endpoint: {}", cfg.live.endpoint);
            Arc::new(WebSocketConnector::new(cfg.live.endpoint.clone(), cfg.api_key()))
        }
        TransportKind::Nats => {
            info!("Live gateway via NATS at {}", cfg.live.nats_url);
            Arc::new(NatsConnector::new(cfg.live.nats_url.clone()))
        }
    };

    let store = JsonFileUsageStore::open(&cfg.usage.store_path)
        .with_context(|| format!("Failed to open usage store {}", cfg.usage.store_path.display()))?;

    let limits = cfg.usage_limits()?;

    let deps = ControllerDeps {
        connector,
        capture: Arc::new(AudioBackendFactory::new(source)),
        output: Arc::new(RenderDevice::new(output)),
        usage: UsageGuard::new(Arc::new(store), limits),
    };

    Ok(SessionController::spawn(cfg.session_config(), deps))
}

async fn serve(cfg: &Config, session: SessionHandle) -> Result<()> {
    let app = create_router(AppState::new(session.clone()));

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    session.stop().await
}

async fn talk(session: SessionHandle, property: &Path, config_id: String) -> Result<()> {
    let raw = std::fs::read_to_string(property)
        .with_context(|| format!("Failed to read {}", property.display()))?;
    let context: PropertyContext = serde_json::from_str(&raw).context("Invalid property JSON")?;

    match session.start(context, config_id).await? {
        StartOutcome::Started { session_id } => info!("Session {} connecting", session_id),
        StartOutcome::Ignored(state) => anyhow::bail!("Session busy ({:?})", state),
        StartOutcome::Rejected(err) => anyhow::bail!("{}", err),
    }

    let mut updates = session.subscribe();
    let mut printed_turns = 0;
    let mut was_connected = false;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();

                for turn in &snapshot.chat_history[printed_turns.min(snapshot.chat_history.len())..] {
                    println!("\r{:?}: {}", turn.speaker, turn.text);
                    for reference in &turn.grounding_references {
                        println!("    [{}] {}", reference.title, reference.uri);
                    }
                }
                printed_turns = snapshot.chat_history.len();

                if !snapshot.interim_transcript.is_empty() {
                    print!("\r> {}", snapshot.interim_transcript);
                    let _ = std::io::stdout().flush();
                }

                match snapshot.state {
                    ConnectionState::Connected => was_connected = true,
                    ConnectionState::Connecting => {}
                    ConnectionState::Disconnected | ConnectionState::Error => {
                        if let Some(err) = &snapshot.session_error {
                            warn!("{}", err);
                        }
                        if was_connected || snapshot.state == ConnectionState::Error {
                            break;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, ending conversation");
                break;
            }
        }
    }

    session.stop().await?;
    println!();
    Ok(())
}
