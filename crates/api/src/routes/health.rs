use axum::extract::State;
use axum::{routing::get, Json, Router};
use linewatch_broker::circuit::CircuitSnapshot;
use linewatch_broker::CircuitState;
use linewatch_core::types::SequenceNumber;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the breaker is open or sequencing faulted.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Publisher circuit breaker.
    pub circuit: CircuitSnapshot,
    /// Newest stored sequence number; absent when the cache is unreachable.
    pub latest_sequence: Option<SequenceNumber>,
    /// Whether the notifier has latched a sequence integrity violation.
    pub integrity_fault: bool,
    pub ws_connections: usize,
}

/// GET /health -- returns pipeline health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let circuit = state.publisher.circuit();
    let integrity_fault = state.notifier.integrity_fault().is_some();
    let latest_sequence = state.notifier.latest().await.ok();

    let degraded =
        circuit.state == CircuitState::Open || integrity_fault || latest_sequence.is_none();
    let status = if degraded { "degraded" } else { "ok" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        circuit,
        latest_sequence,
        integrity_fault,
        ws_connections: state.ws_manager.connection_count().await,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
