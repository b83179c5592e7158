//! Shared application state for the gateway server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request
//! handlers and WebSocket connections.

use std::sync::Arc;

use chatstream_processor::{EventSource, ResponseCoordinator};
use chatstream_store::MessageRepository;

use crate::GatewayConfig;
use crate::session::SessionManager;

/// Shared state accessible from every axum handler.
#[derive(Clone)]
pub struct AppState {
    /// WebSocket session and subscription manager.
    pub sessions: Arc<SessionManager>,

    /// Response-level coordinator driving generations to durable writes.
    pub coordinator: Arc<ResponseCoordinator>,

    /// The agent backend producing event streams.
    pub source: Arc<dyn EventSource>,

    /// Read access to stored conversations.
    pub repository: MessageRepository,

    /// Server configuration.
    pub config: GatewayConfig,
}
