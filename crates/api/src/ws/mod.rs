//! WebSocket transport for live inspection notifications.
//!
//! Provides connection management, the JSON protocol, per-connection
//! sessions, heartbeat pings and the HTTP upgrade handler.

mod handler;
mod heartbeat;
pub mod manager;
pub mod protocol;
pub mod session;

pub use handler::ws_handler;
pub use heartbeat::start_heartbeat;
pub use manager::WsManager;
pub use session::Session;
