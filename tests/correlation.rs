//! Correlated request behavior over a live transport.

mod common;

use std::time::Duration;

use common::MockBroker;
use wiremq::{AckMode, ConnectionFactory, MessagingError, WireFormatKind};

#[tokio::test]
async fn withheld_responses_surface_as_timeouts_without_leaking() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let factory = ConnectionFactory::new(&broker.uri_with("transport.requestTimeout=100"))
        .expect("factory");
    let connection = factory.create_connection().await.expect("connect");

    broker.withhold_responses(true);
    let started = tokio::time::Instant::now();
    let error = connection
        .create_session(AckMode::Auto)
        .await
        .expect_err("the broker is withholding the response");
    assert!(matches!(error, MessagingError::Timeout), "got {error}");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "the deadline must come from transport.requestTimeout"
    );

    // The timed-out entry is gone; the correlator keeps working and later
    // requests match their own responses.
    broker.withhold_responses(false);
    let session = connection
        .create_session(AckMode::Auto)
        .await
        .expect("session after a timeout");
    session.close().await.expect("session close");
    connection.close().await.expect("connection close");
}

#[tokio::test]
async fn responses_match_requests_issued_back_to_back() {
    let broker = MockBroker::start(WireFormatKind::OpenWire).await;
    let factory = ConnectionFactory::new(&broker.uri()).expect("factory");
    let connection = factory.create_connection().await.expect("connect");
    connection.start().await.expect("start");

    // Several correlated registrations in flight one after the other;
    // each must resolve with its own acknowledgement.
    let mut sessions = Vec::new();
    for _ in 0..8 {
        sessions.push(
            connection
                .create_session(AckMode::Auto)
                .await
                .expect("session"),
        );
    }
    for session in &sessions {
        session.close().await.expect("close");
    }
    connection.close().await.expect("connection close");
}
