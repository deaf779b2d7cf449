pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod live;
pub mod session;
pub mod transcript;
pub mod usage;

pub use audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFile, AudioFrame, AudioSource,
    CaptureDevices, OutputDevice, RenderDevice,
};
pub use config::Config;
pub use error::{QuotaKind, SessionError};
pub use http::{create_router, AppState};
pub use live::{LiveConnector, NatsConnector, PropertyContext, WebSocketConnector};
pub use session::{
    ConnectionState, ControllerDeps, SessionConfig, SessionController, SessionHandle,
    SessionSnapshot, StartOutcome,
};
pub use transcript::{ChatTurn, GroundingReference, Speaker};
pub use usage::{JsonFileUsageStore, MemoryUsageStore, UsageGuard, UsageLimits, UsageStore};
