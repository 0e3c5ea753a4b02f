use axum::routing::post;
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Routes mounted at `/events`.
pub fn router() -> Router<AppState> {
    Router::new().route("/", post(handlers::events::publish_event))
}
