#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use linewatch_api::config::{PipelineConfig, ServerConfig};
use linewatch_api::pipeline::Pipeline;
use linewatch_api::router::build_app_router;
use linewatch_api::state::AppState;
use linewatch_api::ws::WsManager;
use linewatch_broker::InMemoryBroker;
use linewatch_core::clock::ManualClock;
use linewatch_core::inspection::Outcome;
use linewatch_core::strategy::FixedStrategy;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// Pipeline tuning that fails fast: one publish attempt, a breaker that
/// opens after two failures.
pub fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        publish_max_attempts: 1,
        publish_base_delay: Duration::from_millis(1),
        circuit_breaker_threshold: 2,
        circuit_breaker_cooldown: Duration::from_secs(30),
        ..Default::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub broker: InMemoryBroker,
    pub pipeline: Pipeline,
    pub clock: ManualClock,
    pub ws_manager: Arc<WsManager>,
    pub cancel: CancellationToken,
}

/// Build the full application router over an in-memory broker. The
/// pipeline's background tasks are not started.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_pipeline_config())
}

pub fn build_test_app_with(pipeline_config: PipelineConfig) -> TestApp {
    let config = test_config();
    let broker = InMemoryBroker::new();
    let clock = ManualClock::new();
    let cancel = CancellationToken::new();
    let pipeline = Pipeline::build(
        &pipeline_config,
        Arc::new(broker.clone()),
        Arc::new(FixedStrategy::new(Outcome::Success)),
        Arc::new(clock.clone()),
        cancel.clone(),
    );
    let ws_manager = Arc::new(WsManager::new());

    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        publisher: Arc::clone(&pipeline.publisher),
        notifier: Arc::clone(&pipeline.notifier),
        shutdown: cancel.clone(),
    };

    TestApp {
        router: build_app_router(state, &config),
        broker,
        pipeline,
        clock,
        ws_manager,
        cancel,
    }
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: &Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn quality_event(event_id: &str) -> serde_json::Value {
    serde_json::json!({
        "event_id": event_id,
        "line_id": "L1",
        "product_id": "P-100",
        "batch_id": "B-7",
        "station_id": "S-3",
        "quality_metrics": { "width_mm": 12.5 },
        "status": "Pass"
    })
}

pub fn processing_result(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "product_id": "P-100",
        "batch_id": "B-7",
        "outcome": "Defect",
        "confidence": 0.91,
        "defect_type": "Scratch",
        "inspected_at": "2026-03-01T10:00:00Z"
    })
}

/// Poll `check` until it holds or five seconds elapse.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
