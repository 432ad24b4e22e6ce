//! Message-flow tests: broker deliveries through the runtime into worker
//! pools, overload spill to the dead-letter queue, and drain on shutdown.

use std::sync::Arc;
use std::time::Duration;

use apiary::broker::MessageBroker;
use apiary::manager::{TenantManager, TenantManagerConfig};
use apiary_testkit::{InMemoryBroker, InMemoryStore, TestHandler};
use tokio::time::timeout;

fn build_manager(
    broker: &InMemoryBroker,
    store: &InMemoryStore,
    handler: &TestHandler,
    default_workers: usize,
) -> TenantManager {
    TenantManager::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        Arc::new(handler.clone()),
        TenantManagerConfig {
            default_workers,
            shutdown_timeout: Duration::from_secs(5),
        },
    )
}

async fn wait_until(
    deadline: Duration,
    what: &str,
    mut condition: impl FnMut() -> bool,
) {
    let waited = timeout(deadline, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn published_messages_reach_the_handler() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let handler = TestHandler::new();
    let manager = build_manager(&broker, &store, &handler, 10);

    let tenant = manager.create_tenant("consumer").await.unwrap();

    for i in 0..20 {
        let payload = serde_json::json!({
            "message_id": i,
            "data": "test data",
        });
        broker
            .publish(tenant.id, payload.to_string().as_bytes())
            .await
            .unwrap();
    }

    wait_until(Duration::from_secs(2), "all deliveries to process", || {
        handler.processed() == 20
    })
    .await;

    assert_eq!(broker.acked_count(tenant.id), 20);
    assert!(broker.dead_letters(tenant.id).is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn overload_spills_to_the_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    // One slow worker: the intake saturates and the excess is rejected.
    let handler = TestHandler::with_delay(Duration::from_millis(500));
    let manager = build_manager(&broker, &store, &handler, 1);

    let tenant = manager.create_tenant("overloaded").await.unwrap();
    let tenant_id = tenant.id;

    let total = 120usize;
    for i in 0..total {
        broker
            .publish(
                tenant_id,
                serde_json::json!({ "n": i }).to_string().as_bytes(),
            )
            .await
            .unwrap();
    }

    let broker_for_wait = broker.clone();
    wait_until(
        Duration::from_secs(5),
        "every delivery to be acked or dead-lettered",
        move || {
            broker_for_wait.acked_count(tenant_id)
                + broker_for_wait.dead_letters(tenant_id).len()
                == total
        },
    )
    .await;

    let dead = broker.dead_letters(tenant_id).len();
    assert!(dead >= 10, "expected spill to the DLQ, got {dead}");

    // The process stays healthy under overload.
    assert_eq!(manager.list_tenants().await.unwrap().len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_handlers() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let handler = TestHandler::with_delay(Duration::from_millis(300));
    let manager = build_manager(&broker, &store, &handler, 1);

    let tenant = manager.create_tenant("draining").await.unwrap();
    broker.publish(tenant.id, b"{}").await.unwrap();

    // Let the worker pick the job up before stopping.
    wait_until(Duration::from_secs(2), "the delivery to be accepted", || {
        broker.acked_count(tenant.id) == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.shutdown().await;
    assert_eq!(handler.processed(), 1);
}

#[tokio::test]
async fn resize_does_not_drop_accepted_jobs() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let handler = TestHandler::with_delay(Duration::from_millis(5));
    let manager = build_manager(&broker, &store, &handler, 2);

    let tenant = manager.create_tenant("elastic").await.unwrap();

    for i in 0..10 {
        broker
            .publish(
                tenant.id,
                serde_json::json!({ "n": i }).to_string().as_bytes(),
            )
            .await
            .unwrap();
    }
    manager.update_concurrency(tenant.id, 8).await.unwrap();

    for i in 10..20 {
        broker
            .publish(
                tenant.id,
                serde_json::json!({ "n": i }).to_string().as_bytes(),
            )
            .await
            .unwrap();
    }
    manager.update_concurrency(tenant.id, 1).await.unwrap();

    for i in 20..30 {
        broker
            .publish(
                tenant.id,
                serde_json::json!({ "n": i }).to_string().as_bytes(),
            )
            .await
            .unwrap();
    }

    wait_until(Duration::from_secs(5), "all jobs to complete", || {
        handler.processed() == 30
    })
    .await;

    assert!(broker.dead_letters(tenant.id).is_empty());
    assert_eq!(broker.acked_count(tenant.id), 30);

    manager.shutdown().await;
}

#[tokio::test]
async fn recovered_tenant_consumes_new_deliveries() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();

    let first_handler = TestHandler::new();
    let first_run = build_manager(&broker, &store, &first_handler, 3);
    let tenant = first_run.create_tenant("phoenix").await.unwrap();
    first_run.shutdown().await;

    let second_handler = TestHandler::new();
    let second_run = build_manager(&broker, &store, &second_handler, 3);
    second_run.recover().await.expect("recover");

    broker
        .publish(tenant.id, br#"{"after":"restart"}"#)
        .await
        .unwrap();

    wait_until(
        Duration::from_secs(2),
        "the recovered runtime to consume",
        || second_handler.processed() == 1,
    )
    .await;
    assert_eq!(
        second_handler.payloads(),
        vec![br#"{"after":"restart"}"#.to_vec()]
    );

    second_run.shutdown().await;
}

#[tokio::test]
async fn failing_handler_does_not_stall_the_stream() {
    let broker = InMemoryBroker::new();
    let store = InMemoryStore::new();
    let handler = TestHandler::failing();
    let manager = build_manager(&broker, &store, &handler, 2);

    let tenant = manager.create_tenant("lossy").await.unwrap();

    for _ in 0..5 {
        broker.publish(tenant.id, b"not json").await.unwrap();
    }

    // Failures are terminal for the job but the pool keeps consuming.
    wait_until(Duration::from_secs(2), "all jobs to run", || {
        handler.processed() == 5
    })
    .await;
    assert_eq!(broker.acked_count(tenant.id), 5);

    manager.shutdown().await;
}
