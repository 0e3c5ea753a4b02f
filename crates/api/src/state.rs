use std::sync::Arc;

use linewatch_broker::ResilientPublisher;
use linewatch_events::FanOutNotifier;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: everything inside is behind `Arc` or is a token.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager (browser clients).
    pub ws_manager: Arc<WsManager>,
    /// Ingress side of the pipeline.
    pub publisher: Arc<ResilientPublisher>,
    /// Sequencing, storage and live delivery of results.
    pub notifier: Arc<FanOutNotifier>,
    /// Cancelled on shutdown; aborts publishes still backing off.
    pub shutdown: CancellationToken,
}
