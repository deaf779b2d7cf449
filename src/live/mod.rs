//! Remote live endpoint: wire messages, prompt construction and transports

pub mod messages;
pub mod nats;
pub mod prompt;
pub mod transport;
pub mod websocket;

pub use messages::{decode_server_message, InboundMessage};
pub use nats::NatsConnector;
pub use prompt::{Location, PropertyContext, SessionSetup};
pub use transport::{LiveConnector, LiveSession, TransportEvent};
pub use websocket::WebSocketConnector;
