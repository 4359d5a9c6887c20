//! Integration tests for the Redis-backed broker, against a real
//! containerized Redis instance.

use std::time::Duration;

use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::Redis;
use uuid::Uuid;

use optd_broker::client::Broker;
use optd_broker::config::BrokerConfig;
use optd_broker::envelope::Envelope;

async fn test_broker() -> (Broker, testcontainers::ContainerAsync<Redis>) {
    let container = Redis::default()
        .with_tag("7")
        .start()
        .await
        .expect("failed to start redis container");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("failed to get mapped port");

    let config = BrokerConfig {
        redis_url: format!("redis://127.0.0.1:{port}"),
        main_queue: format!("test_main_{}", Uuid::new_v4().simple()),
        processing_queue: format!("test_processing_{}", Uuid::new_v4().simple()),
        dead_letter_queue: format!("test_dead_{}", Uuid::new_v4().simple()),
    };

    let broker = Broker::connect(config)
        .await
        .expect("failed to connect to broker");
    (broker, container)
}

#[tokio::test]
async fn input_blob_roundtrip() {
    let (broker, _container) = test_broker().await;
    let task_id = Uuid::new_v4();

    assert!(!broker.input_blob_exists(task_id).await.unwrap());

    broker.set_input_blob(task_id, b"some bytes").await.unwrap();
    assert!(broker.input_blob_exists(task_id).await.unwrap());
    assert_eq!(
        broker.get_input_blob(task_id).await.unwrap(),
        Some(b"some bytes".to_vec())
    );

    broker.delete_input_blob(task_id).await.unwrap();
    assert!(!broker.input_blob_exists(task_id).await.unwrap());
    assert_eq!(broker.get_input_blob(task_id).await.unwrap(), None);
}

#[tokio::test]
async fn enqueue_and_move_to_processing() {
    let (broker, _container) = test_broker().await;
    let envelope = Envelope::new(Uuid::new_v4(), Uuid::new_v4(), "alpha.set", "MyEA", "EURUSD", "H1");

    assert_eq!(broker.main_queue_depth().await.unwrap(), 0);

    broker.enqueue(&envelope).await.unwrap();
    assert_eq!(broker.main_queue_depth().await.unwrap(), 1);
    assert!(broker.envelope_present(envelope.task_id).await.unwrap());

    let moved = broker.move_to_processing().await.unwrap();
    assert_eq!(moved, Some(envelope.clone()));
    assert_eq!(broker.main_queue_depth().await.unwrap(), 0);

    let in_processing = broker.processing_queue_envelopes().await.unwrap();
    assert_eq!(in_processing, vec![envelope.clone()]);
    assert!(broker.envelope_present(envelope.task_id).await.unwrap());
}

#[tokio::test]
async fn move_to_processing_on_empty_queue_returns_none() {
    let (broker, _container) = test_broker().await;
    assert_eq!(broker.move_to_processing().await.unwrap(), None);
}

#[tokio::test]
async fn dead_letter_removes_from_processing() {
    let (broker, _container) = test_broker().await;
    let envelope = Envelope::new(Uuid::new_v4(), Uuid::new_v4(), "beta.set", "MyEA", "GBPUSD", "H4");

    broker.enqueue(&envelope).await.unwrap();
    broker.move_to_processing().await.unwrap();

    broker.move_to_dead_letter(&envelope).await.unwrap();

    assert!(broker.processing_queue_envelopes().await.unwrap().is_empty());
    assert!(!broker.envelope_present(envelope.task_id).await.unwrap());
}

#[tokio::test]
async fn leadership_lease_is_exclusive_until_expiry() {
    let (broker, _container) = test_broker().await;

    let acquired_a = broker
        .try_acquire_leadership("controller-a", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(acquired_a);

    let acquired_b = broker
        .try_acquire_leadership("controller-b", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(!acquired_b, "second holder must not acquire a live lease");

    // The original holder can renew.
    let renewed_a = broker
        .try_acquire_leadership("controller-a", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(renewed_a);

    broker.release_leadership("controller-a").await.unwrap();
    let acquired_b_after_release = broker
        .try_acquire_leadership("controller-b", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(acquired_b_after_release);
}
