//! Linewatch API server library.
//!
//! Exposes the building blocks (config, pipeline wiring, state, error
//! handling, routes, WebSocket transport, background tasks) so integration
//! tests and the binary entrypoint share them.

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
