//! Delivery order, listener dispatch, pull mode, and acknowledgement
//! semantics per mode.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::MockBroker;
use wiremq::{
    AckMode, BrokerMessage, Connection, ConnectionFactory, ConsumerOptions, MessageListener,
    MessagingError, ReceivedMessage, Result, Session, WireFormatKind,
};

async fn started_connection(broker: &MockBroker) -> Connection {
    let connection = ConnectionFactory::new(&broker.uri())
        .expect("factory")
        .create_connection()
        .await
        .expect("connect");
    connection.start().await.expect("start");
    connection
}

async fn seeded_session(
    connection: &Connection,
    ack_mode: AckMode,
    queue_name: &str,
    count: usize,
) -> Session {
    let session = connection.create_session(ack_mode).await.expect("session");
    let queue = session.create_queue(queue_name);
    let producer = session
        .create_producer(Some(&queue))
        .await
        .expect("producer");
    for n in 0..count {
        producer
            .send(BrokerMessage::text(format!("m{n}")))
            .await
            .expect("send");
    }
    producer.close().await.expect("producer close");
    session
}

#[tokio::test]
async fn sync_receive_preserves_broker_order() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = seeded_session(&connection, AckMode::Auto, "ordered", 5).await;

    let consumer = session
        .create_consumer(&session.create_queue("ordered"))
        .await
        .expect("consumer");
    for n in 0..5 {
        let message = consumer
            .receive_timeout(Duration::from_secs(1))
            .await
            .expect("receive")
            .expect("message in order");
        assert_eq!(message.body_text(), Some(format!("m{n}").as_str()));
    }

    connection.close().await.expect("close");
}

#[tokio::test]
async fn receive_no_wait_returns_immediately_when_empty() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session");
    let consumer = session
        .create_consumer(&session.create_queue("empty"))
        .await
        .expect("consumer");

    let nothing = consumer.receive_no_wait().await.expect("receive");
    assert!(nothing.is_none());

    connection.close().await.expect("close");
}

struct CollectingListener {
    seen: Arc<Mutex<Vec<String>>>,
    delivered: tokio::sync::mpsc::Sender<()>,
}

#[async_trait]
impl MessageListener for CollectingListener {
    async fn on_message(&self, message: ReceivedMessage) -> Result<()> {
        let text = message.body_text().unwrap_or_default().to_owned();
        let position = {
            let mut seen = self.seen.lock().expect("seen poisoned");
            seen.push(text);
            seen.len()
        };
        let _ = self.delivered.send(()).await;
        if position == 2 {
            // Listener failures must not stop dispatch.
            return Err(MessagingError::illegal_argument("listener failure"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn listener_dispatch_preserves_order_and_survives_failures() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;

    let routed_errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&routed_errors);
    connection.set_exception_listener(move |error| {
        sink.lock().expect("errors poisoned").push(error.to_string());
    });

    let session = seeded_session(&connection, AckMode::Auto, "listened", 3).await;
    let consumer = session
        .create_consumer(&session.create_queue("listened"))
        .await
        .expect("consumer");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::channel(8);
    consumer
        .set_message_listener(CollectingListener {
            seen: Arc::clone(&seen),
            delivered: delivered_tx,
        })
        .await
        .expect("attach listener");

    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(2), delivered_rx.recv())
            .await
            .expect("listener must keep receiving")
            .expect("delivery signal");
    }
    assert_eq!(*seen.lock().expect("seen poisoned"), vec!["m0", "m1", "m2"]);
    assert_eq!(
        routed_errors.lock().expect("errors poisoned").len(),
        1,
        "the one listener failure goes to the exception listener"
    );

    connection.close().await.expect("close");
}

#[tokio::test]
async fn attaching_a_second_listener_is_rejected() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session");
    let consumer = session
        .create_consumer(&session.create_queue("single"))
        .await
        .expect("consumer");

    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    consumer
        .set_message_listener(CollectingListener {
            seen: Arc::new(Mutex::new(Vec::new())),
            delivered: tx,
        })
        .await
        .expect("first listener");

    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    let error = consumer
        .set_message_listener(CollectingListener {
            seen: Arc::new(Mutex::new(Vec::new())),
            delivered: tx,
        })
        .await
        .expect_err("second listener must be rejected");
    assert!(matches!(error, MessagingError::IllegalState(_)));

    connection.close().await.expect("close");
}

#[tokio::test]
async fn zero_prefetch_pulls_exactly_one_message_per_receive() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = seeded_session(&connection, AckMode::Auto, "pulled", 2).await;

    let consumer = session
        .create_consumer_with(
            &session.create_queue("pulled"),
            ConsumerOptions {
                prefetch: 0,
                ..ConsumerOptions::default()
            },
        )
        .await
        .expect("consumer");

    for n in 0..2 {
        let message = consumer
            .receive_timeout(Duration::from_secs(1))
            .await
            .expect("receive")
            .expect("pulled message");
        assert_eq!(message.body_text(), Some(format!("m{n}").as_str()));
    }
    assert_eq!(broker.pull_count(), 2, "one pull per successful receive");

    let nothing = consumer.receive_no_wait().await.expect("receive");
    assert!(nothing.is_none());
    common::wait_for(
        || broker.pull_count() == 3,
        "the empty receive's message pull",
    )
    .await;

    connection.close().await.expect("close");
}

#[tokio::test]
async fn client_acknowledge_covers_the_whole_delivered_window() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = seeded_session(&connection, AckMode::Client, "manual", 3).await;
    let queue = session.create_queue("manual");

    let consumer = session.create_consumer(&queue).await.expect("consumer");
    let first = consumer
        .receive_timeout(Duration::from_secs(1))
        .await
        .expect("receive")
        .expect("first");
    let second = consumer
        .receive_timeout(Duration::from_secs(1))
        .await
        .expect("receive")
        .expect("second");
    assert_eq!(first.body_text(), Some("m0"));

    // Acknowledging the second covers everything delivered so far.
    second.acknowledge().await.expect("acknowledge");
    common::wait_for(|| broker.acks().len() == 1, "the acknowledgement").await;
    let acks = broker.acks();
    assert_eq!(acks[0].message_count, 2);
    assert_eq!(acks[0].last_message_id, second.message_id.clone());

    // The third stays delivered-but-unacknowledged; closing without an
    // acknowledgement leaves it broker-held for redelivery.
    let third = consumer
        .receive_timeout(Duration::from_secs(1))
        .await
        .expect("receive")
        .expect("third");
    assert_eq!(third.body_text(), Some("m2"));
    consumer.close().await.expect("close consumer");

    let remaining = broker.stored(&queue);
    assert_eq!(remaining.len(), 1, "only the unacknowledged message remains");
    assert_eq!(remaining[0].body_text(), Some("m2"));

    // A fresh consumer sees the retained message again.
    let redelivery = session.create_consumer(&queue).await.expect("consumer");
    let again = redelivery
        .receive_timeout(Duration::from_secs(1))
        .await
        .expect("receive")
        .expect("redelivered");
    assert_eq!(again.body_text(), Some("m2"));

    connection.close().await.expect("close");
}

#[tokio::test]
async fn transacted_sessions_acknowledge_on_commit() {
    use wiremq::command::TransactionOperation;

    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = seeded_session(&connection, AckMode::Transacted, "txn", 2).await;

    // Sending on the transacted session already opened the unit of work.
    let opened = broker.transactions();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].operation_type, TransactionOperation::Begin);

    let consumer = session
        .create_consumer(&session.create_queue("txn"))
        .await
        .expect("consumer");
    for _ in 0..2 {
        consumer
            .receive_timeout(Duration::from_secs(1))
            .await
            .expect("receive")
            .expect("delivery");
    }
    assert!(broker.acks().is_empty(), "nothing is acknowledged before commit");

    session.commit().await.expect("commit");
    common::wait_for(|| broker.acks().len() == 1, "the commit acknowledgement").await;
    let acks = broker.acks();
    assert_eq!(acks[0].message_count, 2);
    assert_eq!(
        acks[0].transaction_id.as_ref(),
        Some(&opened[0].transaction_id),
        "the acknowledgement rides inside the unit of work"
    );

    let closed = broker.transactions();
    assert_eq!(closed.len(), 2);
    assert_eq!(closed[1].operation_type, TransactionOperation::Commit);
    assert_eq!(closed[1].transaction_id, opened[0].transaction_id);

    connection.close().await.expect("close");
}

#[tokio::test]
async fn rollback_releases_the_window_for_redelivery() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let connection = started_connection(&broker).await;
    let session = seeded_session(&connection, AckMode::Transacted, "rolled", 2).await;
    let queue = session.create_queue("rolled");

    let consumer = session.create_consumer(&queue).await.expect("consumer");
    for _ in 0..2 {
        consumer
            .receive_timeout(Duration::from_secs(1))
            .await
            .expect("receive")
            .expect("delivery");
    }
    session.rollback().await.expect("rollback");

    common::wait_for(|| broker.acks().len() == 1, "the rollback acknowledgement").await;
    let acks = broker.acks();
    assert_eq!(acks[0].ack_type, wiremq::command::AckType::Redelivered);
    assert_eq!(
        broker.stored(&queue).len(),
        2,
        "rolled-back messages stay broker-held"
    );

    let transactions = broker.transactions();
    assert_eq!(
        transactions.last().map(|info| info.operation_type),
        Some(wiremq::command::TransactionOperation::Rollback),
        "rollback closes the unit of work with an abort"
    );

    connection.close().await.expect("close");
}
