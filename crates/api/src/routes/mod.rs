pub mod events;
pub mod health;
pub mod inspections;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// Route hierarchy:
///
/// ```text
/// /ws                                  WebSocket (notifications, catch-up)
///
/// /events                              submit a quality event (POST)
///
/// /inspections/results                 submit a processing result (POST)
/// /inspections/missed-events           events after a sequence (GET)
/// /inspections/latest-sequence         newest sequence number (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/events", events::router())
        .nest("/inspections", inspections::router())
}
