use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Routes mounted at `/inspections`.
///
/// ```text
/// POST /results             submit_result
/// GET  /missed-events       missed_events
/// GET  /latest-sequence     latest_sequence
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/results", post(handlers::inspections::submit_result))
        .route("/missed-events", get(handlers::inspections::missed_events))
        .route("/latest-sequence", get(handlers::inspections::latest_sequence))
}
