//! WebSocket gateway for chatstream.
//!
//! This crate owns the client-facing half of the pipeline: the
//! [`SessionManager`] tracks connections, chat bindings, and per-response
//! subscriptions; broker listener tasks pull frames off `response:{id}`
//! channels and deliver them to every bound client; the axum server exposes
//! the `/ws` endpoint plus a small REST surface for reading back stored
//! conversations.

pub mod api;
pub mod error;
pub mod frames;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

pub use error::{GatewayError, GatewayResult};
pub use frames::{WsMessage, WsMessageType, format_event_for_websocket};
pub use server::GatewayServer;
pub use session::{ClientSink, SessionManager};
pub use state::AppState;

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: String,
    /// The port to listen on.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8710,
        }
    }
}
