//! End-to-end: HTTP ingress through broker, consumer, result relay and
//! notifier to a live subscriber.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use axum::http::StatusCode;
use common::{build_test_app, post_json, quality_event, wait_until};
use linewatch_events::NotificationEvent;
use tokio::sync::mpsc::Receiver;

async fn next_event(rx: &mut Receiver<NotificationEvent>) -> NotificationEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification in time")
        .expect("subscription open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accepted_events_reach_subscribers_in_sequence() {
    let app = build_test_app();
    let mut live = app.pipeline.notifier.subscribe("observer").await;
    let tasks = app.pipeline.start();

    for i in 0..3 {
        let response = post_json(&app.router, "/api/v1/events", quality_event(&format!("E{i}"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let mut seqs = Vec::new();
    let mut ids = HashSet::new();
    for _ in 0..3 {
        let event = next_event(&mut live).await;
        seqs.push(event.sequence_number);
        ids.insert(event.payload.id);
    }
    assert_eq!(seqs, vec![1, 2, 3]);
    assert_eq!(ids, HashSet::from(["E0".into(), "E1".into(), "E2".into()]));
    assert_eq!(app.pipeline.notifier.latest().await.unwrap(), 3);

    tokio::time::timeout(Duration::from_secs(10), tasks.stop(Duration::from_secs(5)))
        .await
        .expect("pipeline stops");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubmitted_event_is_processed_once() {
    let app = build_test_app();
    let mut live = app.pipeline.notifier.subscribe("observer").await;
    let tasks = app.pipeline.start();

    for id in ["dup", "dup", "after"] {
        post_json(&app.router, "/api/v1/events", quality_event(id)).await;
    }

    let mut ids = HashSet::new();
    for _ in 0..2 {
        ids.insert(next_event(&mut live).await.payload.id);
    }
    assert_eq!(ids, HashSet::from(["dup".into(), "after".into()]));

    wait_until(|| app.broker.queue_depth("inspection-requests") == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(live.try_recv().is_err());
    assert_eq!(app.pipeline.consumer.idempotency().len(), 2);
    assert_eq!(app.broker.queue_depth("inspection-dlq"), 0);

    tasks.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipeline_recovers_after_broker_connections_drop() {
    let app = build_test_app();
    let mut live = app.pipeline.notifier.subscribe("observer").await;
    let tasks = app.pipeline.start();

    post_json(&app.router, "/api/v1/events", quality_event("before")).await;
    assert_eq!(next_event(&mut live).await.payload.id, "before");

    app.broker.drop_connections();

    let response = post_json(&app.router, "/api/v1/events", quality_event("after")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let event = next_event(&mut live).await;
    assert_eq!(event.payload.id, "after");
    assert_eq!(event.sequence_number, 2);

    tasks.stop(Duration::from_secs(5)).await;
}
