mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use linewatch_broker::{
    CircuitConfig, CircuitState, InMemoryBroker, ResilientPublisher, RetryPolicy, Topology,
};
use linewatch_core::clock::ManualClock;
use linewatch_core::envelope::MessageEnvelope;
use linewatch_core::error::PipelineError;
use tokio_util::sync::CancellationToken;

use common::request_envelope;

const COOLDOWN: Duration = Duration::from_secs(30);

fn single_shot_publisher(broker: &InMemoryBroker, clock: &ManualClock) -> ResilientPublisher {
    ResilientPublisher::new(
        Arc::new(broker.clone()),
        Topology::default(),
        RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        CircuitConfig {
            failure_threshold: 5,
            cooldown: COOLDOWN,
        },
        Arc::new(clock.clone()),
    )
}

fn io_count(broker: &InMemoryBroker) -> u64 {
    broker.publish_attempts() + broker.connect_attempts()
}

async fn trip(publisher: &ResilientPublisher, broker: &InMemoryBroker) {
    let cancel = CancellationToken::new();
    publisher
        .publish(&request_envelope("warmup"), &cancel)
        .await
        .unwrap();

    broker.fail_next_publishes(u32::MAX);
    for i in 0..5 {
        let result = publisher
            .publish(&request_envelope(&format!("E{i}")), &cancel)
            .await;
        assert_matches!(result, Err(PipelineError::Transient(_)));
    }
    assert_eq!(publisher.circuit().state, CircuitState::Open);
}

#[tokio::test]
async fn open_circuit_rejects_without_io() {
    let broker = InMemoryBroker::new();
    let clock = ManualClock::new();
    let publisher = single_shot_publisher(&broker, &clock);
    trip(&publisher, &broker).await;

    let before = io_count(&broker);
    for i in 0..10 {
        let result = publisher
            .publish(&request_envelope(&format!("R{i}")), &CancellationToken::new())
            .await;
        assert_matches!(
            result,
            Err(PipelineError::BrokerUnavailable { retry_after }) if retry_after <= COOLDOWN
        );
    }
    assert_eq!(io_count(&broker), before);
}

#[tokio::test]
async fn successful_trial_closes_circuit() {
    let broker = InMemoryBroker::new();
    let clock = ManualClock::new();
    let publisher = single_shot_publisher(&broker, &clock);
    trip(&publisher, &broker).await;

    clock.advance(COOLDOWN);
    broker.fail_next_publishes(0);

    publisher
        .publish(&request_envelope("trial"), &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = publisher.circuit();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[tokio::test]
async fn failed_trial_reopens_with_fresh_cooldown() {
    let broker = InMemoryBroker::new();
    let clock = ManualClock::new();
    let publisher = single_shot_publisher(&broker, &clock);
    trip(&publisher, &broker).await;

    clock.advance(COOLDOWN + Duration::from_secs(5));
    assert_matches!(
        publisher
            .publish(&request_envelope("trial"), &CancellationToken::new())
            .await,
        Err(PipelineError::Transient(_))
    );

    assert_eq!(publisher.circuit().state, CircuitState::Open);
    assert_matches!(
        publisher
            .publish(&request_envelope("after"), &CancellationToken::new())
            .await,
        Err(PipelineError::BrokerUnavailable { retry_after }) if retry_after == COOLDOWN
    );
}

#[tokio::test]
async fn concurrent_first_publishes_connect_once() {
    let broker = InMemoryBroker::new();
    let publisher = Arc::new(single_shot_publisher(&broker, &ManualClock::new()));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move {
                publisher
                    .publish(
                        &MessageEnvelope::new(format!("E{i}"), serde_json::json!({})),
                        &CancellationToken::new(),
                    )
                    .await
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.queue_depth("inspection-requests"), 10);
}

#[tokio::test]
async fn publisher_reconnects_after_channel_drop() {
    let broker = InMemoryBroker::new();
    let publisher = single_shot_publisher(&broker, &ManualClock::new());
    let cancel = CancellationToken::new();

    publisher.publish(&request_envelope("a"), &cancel).await.unwrap();
    broker.drop_connections();
    publisher.publish(&request_envelope("b"), &cancel).await.unwrap();

    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.queue_depth("inspection-requests"), 2);
}
