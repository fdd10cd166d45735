mod common;

use common::*;
use std::time::Duration;
use txroute::application::dead_letter::{
    HEADER_DELIVERY_ATTEMPTS, HEADER_FAILURE_CAUSE, HEADER_UNIT_OF_WORK,
};
use txroute::application::engine::RouteEngine;
use txroute::config::EngineSettings;
use txroute::domain::route::{Step, TransactionPolicy};
use txroute::infrastructure::channel::ChannelRegistry;

const OPERATOR: &str = "operator.alerts";

fn contended_settings(resource_retries: u32) -> EngineSettings {
    EngineSettings {
        lock_timeout_ms: 20,
        resource_retries,
        retry_backoff_ms: 5,
        ..EngineSettings::default()
    }
}

#[tokio::test]
async fn test_redelivery_then_dead_letter() {
    let engine = engine(vec![
        transfer_route(
            "transfer",
            TransactionPolicy::Local,
            vec![Step::debit("foo"), Step::throw("forced exception for test")],
        )
        .with_redelivery(2, 1),
    ])
    .await;
    engine.start();

    submit(&engine, 100);
    let dead = engine.receive(DLQ, RECEIVE_TIMEOUT).await.unwrap();
    assert_eq!(dead.header(HEADER_DELIVERY_ATTEMPTS), Some("3"));
    assert!(engine.wait_for_processed(1, RECEIVE_TIMEOUT).await);

    assert!(engine.receive(DLQ, SHORT_TIMEOUT).await.is_none());
    assert_eq!(balances(&engine).await, (1000, 1000));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_lock_contention_exhausts_retries() {
    let engine = engine_with_settings(
        vec![transfer_route(
            "transfer",
            TransactionPolicy::Local,
            transfer_steps(),
        )],
        ChannelRegistry::new(),
        contended_settings(2),
    )
    .await;

    let mut holder = engine.ledger().begin_session();
    holder.write("foo", 0).await.unwrap();

    let report = engine.process("transfer", message(100)).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    let dead = engine.receive(DLQ, SHORT_TIMEOUT).await.unwrap();
    assert!(dead.header(HEADER_FAILURE_CAUSE).unwrap().contains("gave up"));

    holder.rollback();
    let report = engine.process("transfer", message(100)).await.unwrap();
    assert!(report.is_success());
    assert_eq!(balances(&engine).await, (900, 1100));
}

#[tokio::test]
async fn test_lock_contention_recovers_within_retries() {
    let engine = engine_with_settings(
        vec![transfer_route(
            "transfer",
            TransactionPolicy::Local,
            transfer_steps(),
        )],
        ChannelRegistry::new(),
        contended_settings(50),
    )
    .await;

    let mut holder = engine.ledger().begin_session();
    holder.write("bar", 0).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        holder.rollback();
    });

    let report = engine.process("transfer", message(100)).await.unwrap();
    release.await.unwrap();
    assert!(report.is_success());
    assert_eq!(balances(&engine).await, (900, 1100));
}

#[tokio::test]
async fn test_untransacted_contention_applies_each_update_once() {
    let engine = engine_with_settings(
        vec![transfer_route(
            "transfer",
            TransactionPolicy::None,
            vec![Step::debit("foo"), Step::credit("bar")],
        )],
        ChannelRegistry::new(),
        contended_settings(50),
    )
    .await;

    // foo is debited straight away; only the credit to bar has to wait.
    let mut holder = engine.ledger().begin_session();
    holder.write("bar", 0).await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        holder.rollback();
    });

    let report = engine.process("transfer", message(100)).await.unwrap();
    release.await.unwrap();
    assert!(report.is_success());
    assert_eq!(balances(&engine).await, (900, 1100));
}

#[tokio::test]
async fn test_untransacted_route_rejects_redelivery() {
    let routes = vec![
        transfer_route(
            "transfer",
            TransactionPolicy::None,
            vec![Step::debit("foo"), Step::credit("bar")],
        )
        .with_redelivery(2, 1),
    ];
    let err = RouteEngine::new(
        seeded_ledger().await,
        ChannelRegistry::new(),
        &settings(),
        routes,
    )
    .err()
    .unwrap();
    assert!(err.to_string().contains("cannot be redelivered"));
}

#[tokio::test]
async fn test_local_flush_failure_is_reported_to_operator() {
    let channels = ChannelRegistry::new();
    channels.declare(OUTGOING, Some(0)).unwrap();
    let engine = engine_with_channels(
        vec![
            transfer_route("transfer", TransactionPolicy::Local, transfer_steps())
                .with_redelivery(3, 0),
        ],
        channels,
    )
    .await;

    let report = engine.process("transfer", message(100)).await.unwrap();
    assert_eq!(report.hazards, 1);
    assert_eq!(report.dead_lettered, 0);

    let alert = engine.receive(OPERATOR, SHORT_TIMEOUT).await.unwrap();
    assert!(alert.header(HEADER_UNIT_OF_WORK).is_some());
    assert_eq!(alert.header(HEADER_DELIVERY_ATTEMPTS), Some("1"));
    // The ledger committed before the flush failed; that is the hazard.
    assert_eq!(balances(&engine).await, (900, 1100));
    assert_eq!(engine.channels().depth(DLQ), 0);
}

#[tokio::test]
async fn test_two_phase_full_channel_aborts_cleanly() {
    let channels = ChannelRegistry::new();
    channels.declare(OUTGOING, Some(0)).unwrap();
    let engine = engine_with_channels(
        vec![transfer_route(
            "transfer",
            TransactionPolicy::DistributedTwoPhase,
            transfer_steps(),
        )],
        channels,
    )
    .await;

    let report = engine.process("transfer", message(100)).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.hazards, 0);
    assert_eq!(balances(&engine).await, (1000, 1000));

    let dead = engine.receive(DLQ, SHORT_TIMEOUT).await.unwrap();
    assert!(dead.header(HEADER_FAILURE_CAUSE).unwrap().contains("voted abort"));
}

#[tokio::test]
async fn test_full_dead_letter_channel_drops_message() {
    let channels = ChannelRegistry::new();
    channels.declare(DLQ, Some(0)).unwrap();
    let engine = engine_with_channels(
        vec![transfer_route(
            "transfer",
            TransactionPolicy::Local,
            vec![Step::throw("boom")],
        )],
        channels,
    )
    .await;
    engine.start();

    submit(&engine, 1);
    assert!(engine.wait_for_processed(1, RECEIVE_TIMEOUT).await);
    assert_eq!(engine.channels().depth(DLQ), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_compensating_route_restores_balances() {
    let engine = engine(vec![transfer_route(
        "transfer",
        TransactionPolicy::Compensating,
        vec![
            Step::debit("foo"),
            Step::credit("bar"),
            Step::throw("forced exception for test"),
        ],
    )])
    .await;

    let report = engine.process("transfer", message(100)).await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(balances(&engine).await, (1000, 1000));
}
