//! Lifecycle manager sweeps and teardown after transport failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockBroker;
use wiremq::{
    AckMode, BrokerMessage, ConnectionFactory, ConnectionState, MessagingError,
    ResourceLifecycleManager, SessionPool, WireFormatKind,
};

#[tokio::test]
async fn destroy_releases_each_handle_exactly_once() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = ConnectionFactory::new(&broker.uri())
        .expect("factory")
        .create_connection()
        .await
        .expect("connect");
    connection.start().await.expect("start");

    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session");
    let queue = session.create_queue("swept");
    let producer = session
        .create_producer(Some(&queue))
        .await
        .expect("producer");
    let consumer = session.create_consumer(&queue).await.expect("consumer");

    let lifecycle = ResourceLifecycleManager::new();
    lifecycle.register_connection(connection.clone());
    lifecycle.register_session(session.clone());
    lifecycle.register_producer(producer.clone());
    lifecycle.register_consumer(consumer.clone());
    assert_eq!(lifecycle.outstanding(), 4);
    assert_eq!(broker.entity_count(), 4);

    lifecycle.destroy().await.expect("destroy");
    assert_eq!(lifecycle.outstanding(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.entity_count(), 0, "every registration is released once");

    // A second sweep has nothing to do and must not double-release.
    lifecycle.destroy().await.expect("second destroy");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.entity_count(), 0);
}

#[tokio::test]
async fn pooled_session_resources_register_with_the_lifecycle_manager() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = ConnectionFactory::new(&broker.uri())
        .expect("factory")
        .create_connection()
        .await
        .expect("connect");
    connection.start().await.expect("start");

    let lifecycle = Arc::new(ResourceLifecycleManager::new());
    let pool = SessionPool::new(connection.clone(), AckMode::Auto, Arc::clone(&lifecycle));

    // Everything created through the pooled session is tracked.
    let pooled = pool.take().await.expect("checkout");
    assert_eq!(lifecycle.outstanding(), 1, "the pooled session is tracked");
    let queue = pooled.create_queue("tracked");
    let producer = pooled
        .create_producer(Some(&queue))
        .await
        .expect("producer");
    let _consumer = pooled.create_consumer(&queue).await.expect("consumer");
    let _temporary = pooled.create_temporary_queue().await.expect("temporary");
    assert_eq!(lifecycle.outstanding(), 4);
    assert_eq!(broker.entity_count(), 5, "connection plus four registrations");

    // Closed handles are pruned as new ones register, so per-call
    // producers do not accumulate.
    producer.close().await.expect("producer close");
    let _replacement = pooled
        .create_producer(Some(&queue))
        .await
        .expect("second producer");
    assert_eq!(lifecycle.outstanding(), 4, "the closed producer was pruned");

    pool.give_back(pooled).await.expect("return");
    lifecycle.destroy().await.expect("destroy");
    assert_eq!(lifecycle.outstanding(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        broker.entity_count(),
        1,
        "only the connection itself remains registered"
    );

    connection.close().await.expect("close");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.entity_count(), 0);
}

#[tokio::test]
async fn transport_failure_wakes_receivers_and_closes_the_connection() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = ConnectionFactory::new(&broker.uri())
        .expect("factory")
        .create_connection()
        .await
        .expect("connect");
    connection.start().await.expect("start");
    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session");
    let consumer = session
        .create_consumer(&session.create_queue("doomed"))
        .await
        .expect("consumer");

    let lifecycle = Arc::new(ResourceLifecycleManager::new());
    lifecycle.register_connection(connection.clone());
    lifecycle.register_session(session.clone());
    lifecycle.register_consumer(consumer.clone());

    // A receive with no deadline is parked on the inbound queue.
    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    broker.kill_connections();

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("the pending receive must wake")
        .expect("join");
    assert!(
        matches!(outcome, Err(MessagingError::Transport(_))),
        "got {outcome:?}"
    );

    // The next user operation observes the dead transport and the
    // connection lands in its terminal state.
    let error = connection
        .create_session(AckMode::Auto)
        .await
        .expect_err("connection is unusable");
    assert!(matches!(error, MessagingError::Transport(_)));
    assert_eq!(connection.state(), ConnectionState::Closed);

    // The sweep still releases every local handle; broker-side failures
    // are absorbed and the first one reported.
    let sweep = lifecycle.destroy().await;
    assert!(sweep.is_err(), "releases over a dead transport fail");
    assert_eq!(lifecycle.outstanding(), 0);
}

#[tokio::test]
async fn sends_fail_cleanly_after_the_peer_goes_away() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = ConnectionFactory::new(&broker.uri())
        .expect("factory")
        .create_connection()
        .await
        .expect("connect");
    connection.start().await.expect("start");
    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session");
    let producer = session
        .create_producer(Some(&session.create_queue("late")))
        .await
        .expect("producer");

    broker.kill_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let error = producer
        .send(BrokerMessage::text("too late"))
        .await
        .expect_err("the transport is gone");
    assert!(matches!(
        error,
        MessagingError::Transport(_) | MessagingError::Timeout
    ));
}
