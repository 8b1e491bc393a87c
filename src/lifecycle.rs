//! Deterministic release of broker-held handles.
//!
//! The manager records every broker-registered resource a component
//! creates and releases them in dependency-safe order: producers, then
//! consumers, then temporary destinations, then sessions, then
//! connections. Errors during a sweep are absorbed and logged so every
//! handle still gets its one release; the first error is returned once
//! the sweep finishes. A second `destroy` is a no-op because the lists
//! are cleared as part of the sweep.

use std::sync::Mutex;

use crate::connection::{Connection, ConnectionState};
use crate::consumer::MessageConsumer;
use crate::destination::Destination;
use crate::error::{MessagingError, Result};
use crate::producer::MessageProducer;
use crate::session::{Session, SessionState};

/// Registry guaranteeing exactly-once release of broker-side handles.
#[derive(Default)]
pub struct ResourceLifecycleManager {
    connections: Mutex<Vec<Connection>>,
    sessions: Mutex<Vec<Session>>,
    producers: Mutex<Vec<MessageProducer>>,
    consumers: Mutex<Vec<MessageConsumer>>,
    destinations: Mutex<Vec<(Connection, Destination)>>,
}

impl ResourceLifecycleManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection for release.
    pub fn register_connection(&self, connection: Connection) {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .push(connection);
    }

    /// Track a session for release.
    pub fn register_session(&self, session: Session) {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .push(session);
    }

    /// Track a producer for release.
    ///
    /// Handles that were already closed through another path are pruned
    /// on the way in, keeping the registry bounded by live resources.
    pub fn register_producer(&self, producer: MessageProducer) {
        let mut producers = self.producers.lock().expect("producer registry poisoned");
        producers.retain(|tracked| !tracked.is_closed());
        producers.push(producer);
    }

    /// Track a consumer for release.
    ///
    /// Prunes already-closed consumers on the way in, like
    /// [`register_producer`](Self::register_producer).
    pub fn register_consumer(&self, consumer: MessageConsumer) {
        let mut consumers = self.consumers.lock().expect("consumer registry poisoned");
        consumers.retain(|tracked| !tracked.is_closed());
        consumers.push(consumer);
    }

    /// Track a destination for release. Only temporaries are broker-held;
    /// others are recorded and skipped by the sweep.
    pub fn register_destination(&self, connection: Connection, destination: Destination) {
        self.destinations
            .lock()
            .expect("destination registry poisoned")
            .push((connection, destination));
    }

    /// Number of handles currently tracked.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.connections.lock().expect("connection registry poisoned").len()
            + self.sessions.lock().expect("session registry poisoned").len()
            + self.producers.lock().expect("producer registry poisoned").len()
            + self.consumers.lock().expect("consumer registry poisoned").len()
            + self
                .destinations
                .lock()
                .expect("destination registry poisoned")
                .len()
    }

    /// Drop entries whose handles are already closed.
    pub fn prune(&self) {
        self.producers
            .lock()
            .expect("producer registry poisoned")
            .retain(|producer| !producer.is_closed());
        self.consumers
            .lock()
            .expect("consumer registry poisoned")
            .retain(|consumer| !consumer.is_closed());
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .retain(|session| session.state() != SessionState::Closed);
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .retain(|connection| connection.state() != ConnectionState::Closed);
        self.destinations
            .lock()
            .expect("destination registry poisoned")
            .retain(|(connection, _)| connection.state() != ConnectionState::Closed);
    }

    /// Forget every tracked handle without releasing anything.
    pub fn release_all(&self) {
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .clear();
        self.sessions.lock().expect("session registry poisoned").clear();
        self.producers
            .lock()
            .expect("producer registry poisoned")
            .clear();
        self.consumers
            .lock()
            .expect("consumer registry poisoned")
            .clear();
        self.destinations
            .lock()
            .expect("destination registry poisoned")
            .clear();
    }

    /// Close and forget every tracked handle, in dependency-safe order.
    ///
    /// # Errors
    ///
    /// Returns the first error observed; later failures are absorbed so
    /// the sweep always completes.
    pub async fn destroy(&self) -> Result<()> {
        let producers = std::mem::take(
            &mut *self.producers.lock().expect("producer registry poisoned"),
        );
        let consumers = std::mem::take(
            &mut *self.consumers.lock().expect("consumer registry poisoned"),
        );
        let destinations = std::mem::take(
            &mut *self
                .destinations
                .lock()
                .expect("destination registry poisoned"),
        );
        let sessions =
            std::mem::take(&mut *self.sessions.lock().expect("session registry poisoned"));
        let connections = std::mem::take(
            &mut *self
                .connections
                .lock()
                .expect("connection registry poisoned"),
        );

        let mut first_error: Option<MessagingError> = None;
        let mut absorb = |result: Result<()>| {
            if let Err(error) = result {
                log::warn!("absorbing release failure: {error}");
                first_error.get_or_insert(error);
            }
        };

        for producer in producers {
            absorb(producer.close().await);
        }
        for consumer in consumers {
            absorb(consumer.close().await);
        }
        for (connection, destination) in destinations {
            if destination.is_temporary() {
                absorb(
                    connection
                        .inner()
                        .remove_temporary_destination(&destination)
                        .await,
                );
            }
        }
        for session in sessions {
            absorb(session.close().await);
        }
        for connection in connections {
            absorb(connection.close().await);
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ResourceLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLifecycleManager")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
