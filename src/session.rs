//! Sessions: the unit of message ordering and acknowledgement.
//!
//! A [`Session`] is created under a connection with a fixed
//! acknowledgement mode and owns the producers and consumers registered
//! through it. Sessions are deliberately not thread-safe; the template
//! layer enforces the one-user-at-a-time discipline. Listener callbacks of
//! all consumers of a session are serialized through a shared dispatch
//! gate so user code never runs concurrently against the same session.

use std::sync::{Arc, Mutex, Weak};

use crate::command::{
    BrokerMessage, Command, CommandBody, ProducerInfo, RemovedEntity, SessionId, TransactionId,
    TransactionInfo, TransactionOperation,
};
use crate::connection::{Connection, ConnectionInner};
use crate::consumer::{ConsumerInner, ConsumerOptions, MessageConsumer};
use crate::destination::{Destination, DestinationKind, DestinationResolver};
use crate::error::{MessagingError, Result};
use crate::lifecycle::ResourceLifecycleManager;
use crate::producer::{MessageProducer, ProducerInner};

/// When acknowledgements are emitted for delivered messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// Acknowledge automatically after the listener or `receive` returns.
    Auto,
    /// The application acknowledges explicitly.
    Client,
    /// Acknowledge lazily in batches; duplicates possible after reconnect.
    DupsOk,
    /// Acknowledge on `commit`; `rollback` releases redelivery.
    Transacted,
}

impl AckMode {
    /// All modes, indexable by [`AckMode::index`].
    pub const ALL: [AckMode; 4] = [
        AckMode::Auto,
        AckMode::Client,
        AckMode::DupsOk,
        AckMode::Transacted,
    ];

    /// Stable slot index used by the session pool.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            AckMode::Auto => 0,
            AckMode::Client => 1,
            AckMode::DupsOk => 2,
            AckMode::Transacted => 3,
        }
    }
}

/// Lifecycle states of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Usable.
    Open,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

/// A broker session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) ack_mode: AckMode,
    pub(crate) connection: Arc<ConnectionInner>,
    state: Mutex<SessionState>,
    consumers: Mutex<Vec<Weak<ConsumerInner>>>,
    producers: Mutex<Vec<Weak<ProducerInner>>>,
    resolver: Mutex<DestinationResolver>,
    /// Open unit of work; only populated on transacted sessions.
    transaction: Mutex<Option<TransactionId>>,
    /// Lifecycle manager the owning pool attached, held weakly so the
    /// registry can own sessions without a reference cycle.
    lifecycle: Mutex<Option<Weak<ResourceLifecycleManager>>>,
    /// Serializes listener callbacks across this session's consumers.
    pub(crate) dispatch_gate: Arc<tokio::sync::Mutex<()>>,
}

impl Session {
    pub(crate) fn register(
        connection: Arc<ConnectionInner>,
        id: SessionId,
        ack_mode: AckMode,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                ack_mode,
                connection,
                state: Mutex::new(SessionState::Open),
                consumers: Mutex::new(Vec::new()),
                producers: Mutex::new(Vec::new()),
                resolver: Mutex::new(DestinationResolver::new(false)),
                transaction: Mutex::new(None),
                lifecycle: Mutex::new(None),
                dispatch_gate: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Attach the lifecycle manager that should track resources created
    /// through this session.
    pub(crate) fn attach_lifecycle(&self, lifecycle: &Arc<ResourceLifecycleManager>) {
        *self.inner.lifecycle.lock().expect("lifecycle poisoned") =
            Some(Arc::downgrade(lifecycle));
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    /// Identity of this session.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    /// The acknowledgement mode fixed at creation.
    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.inner.ack_mode
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().expect("session state poisoned")
    }

    /// Create a producer, optionally bound to a default destination.
    pub async fn create_producer(
        &self,
        destination: Option<&Destination>,
    ) -> Result<MessageProducer> {
        self.inner.check_open()?;
        let producer_id = self.inner.connection.ids.next_producer_id(&self.inner.id);
        let info = ProducerInfo {
            producer_id,
            destination: destination.cloned(),
        };
        self.inner
            .connection
            .register_entity(Command::new(CommandBody::ProducerInfo(info.clone())))
            .await?;
        let producer = MessageProducer::register(Arc::clone(&self.inner), info);
        self.inner
            .producers
            .lock()
            .expect("producer list poisoned")
            .push(producer.downgrade());
        if let Some(lifecycle) = self.inner.attached_lifecycle() {
            lifecycle.register_producer(producer.clone());
        }
        Ok(producer)
    }

    /// Create a consumer with default options.
    pub async fn create_consumer(&self, destination: &Destination) -> Result<MessageConsumer> {
        self.create_consumer_with(destination, ConsumerOptions::default())
            .await
    }

    /// Create a consumer with an explicit selector, no-local flag, and
    /// prefetch size. A prefetch of zero puts the consumer in pull mode.
    pub async fn create_consumer_with(
        &self,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<MessageConsumer> {
        self.inner.check_open()?;
        let consumer = MessageConsumer::register(Arc::clone(&self.inner), destination, options)
            .await?;
        self.inner
            .consumers
            .lock()
            .expect("consumer list poisoned")
            .push(consumer.downgrade());
        if let Some(lifecycle) = self.inner.attached_lifecycle() {
            lifecycle.register_consumer(consumer.clone());
        }
        Ok(consumer)
    }

    /// A queue handle for `name`.
    #[must_use]
    pub fn create_queue(&self, name: &str) -> Destination {
        Destination::queue(name)
    }

    /// A topic handle for `name`.
    #[must_use]
    pub fn create_topic(&self, name: &str) -> Destination {
        Destination::topic(name)
    }

    /// Create a broker-side temporary queue owned by the connection.
    pub async fn create_temporary_queue(&self) -> Result<Destination> {
        self.create_temporary(DestinationKind::TemporaryQueue).await
    }

    /// Create a broker-side temporary topic owned by the connection.
    pub async fn create_temporary_topic(&self) -> Result<Destination> {
        self.create_temporary(DestinationKind::TemporaryTopic).await
    }

    async fn create_temporary(&self, kind: DestinationKind) -> Result<Destination> {
        self.inner.check_open()?;
        let destination = self
            .inner
            .connection
            .create_temporary_destination(kind)
            .await?;
        if let Some(lifecycle) = self.inner.attached_lifecycle() {
            lifecycle.register_destination(
                Connection::from_inner(Arc::clone(&self.inner.connection)),
                destination.clone(),
            );
        }
        Ok(destination)
    }

    /// Resolve a destination name through the per-session cache.
    ///
    /// Names may carry a `queue://` or `topic://` prefix; bare names
    /// default to queues.
    pub fn resolve_destination(&self, name: &str) -> Result<Destination> {
        self.inner
            .resolver
            .lock()
            .expect("resolver poisoned")
            .resolve(name)
    }

    /// Build an empty text message.
    #[must_use]
    pub fn create_text_message(&self, text: impl Into<String>) -> BrokerMessage {
        BrokerMessage::text(text)
    }

    /// Build a bytes message.
    #[must_use]
    pub fn create_bytes_message(&self, bytes: impl Into<Vec<u8>>) -> BrokerMessage {
        BrokerMessage::bytes(bytes)
    }

    /// Commit the transaction: acknowledge everything delivered since the
    /// last completion and close the unit of work at the broker.
    ///
    /// # Errors
    ///
    /// [`MessagingError::IllegalState`] unless the session is transacted.
    pub async fn commit(&self) -> Result<()> {
        self.complete_transaction(true).await
    }

    /// Roll the transaction back: delivered messages are released for
    /// redelivery and sent messages are discarded by the broker.
    pub async fn rollback(&self) -> Result<()> {
        self.complete_transaction(false).await
    }

    async fn complete_transaction(&self, commit: bool) -> Result<()> {
        self.inner.check_open()?;
        if self.inner.ack_mode != AckMode::Transacted {
            return Err(MessagingError::illegal_state(
                "commit and rollback require a transacted session",
            ));
        }
        let consumers = self.inner.live_consumers();
        let has_deliveries = consumers
            .iter()
            .any(|consumer| MessageConsumer::from_inner(Arc::clone(consumer)).has_unacked());
        if self.inner.current_transaction().is_none() && !has_deliveries {
            // Nothing sent, nothing delivered: no unit of work to close.
            return Ok(());
        }

        let transaction_id = self.inner.ensure_transaction().await?;
        for consumer in consumers {
            MessageConsumer::from_inner(consumer)
                .complete_transaction(commit, &transaction_id)
                .await?;
        }

        let operation_type = if commit {
            TransactionOperation::Commit
        } else {
            TransactionOperation::Rollback
        };
        let close = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: self.inner.connection.info.connection_id.clone(),
            transaction_id,
            operation_type,
        }));
        let outcome = self
            .inner
            .connection
            .transport
            .request(close, self.inner.connection.options.request_timeout)
            .await;
        self.inner.clear_transaction();
        outcome.map(|_| ())
    }

    /// Close the session: producers first, then consumers, then the
    /// broker-side registration. Idempotent.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("session state poisoned");
            if *state != SessionState::Open {
                return Ok(());
            }
            *state = SessionState::Closing;
        }

        let mut first_error = None;
        for producer in self.inner.live_producers() {
            if let Err(error) = MessageProducer::from_inner(producer).close().await {
                log::warn!("absorbing producer close failure: {error}");
                first_error.get_or_insert(error);
            }
        }
        for consumer in self.inner.live_consumers() {
            if let Err(error) = MessageConsumer::from_inner(consumer).close().await {
                log::warn!("absorbing consumer close failure: {error}");
                first_error.get_or_insert(error);
            }
        }

        let removal = self
            .inner
            .connection
            .remove_entity(RemovedEntity::Session(self.inner.id.clone()))
            .await;
        *self.inner.state.lock().expect("session state poisoned") = SessionState::Closed;
        log::debug!("session {} closed", self.inner.id);

        match first_error {
            Some(error) => Err(error),
            None => removal,
        }
    }

    /// True when any consumer still holds delivered-but-unacknowledged
    /// messages.
    pub(crate) fn has_unacked(&self) -> bool {
        self.inner
            .live_consumers()
            .into_iter()
            .any(|consumer| MessageConsumer::from_inner(consumer).has_unacked())
    }

    /// True while a transacted unit of work is open.
    pub(crate) fn has_open_transaction(&self) -> bool {
        self.inner.current_transaction().is_some()
    }

    /// Detach every consumer's listener, e.g. before re-pooling.
    pub(crate) fn clear_listeners(&self) {
        for consumer in self.inner.live_consumers() {
            MessageConsumer::from_inner(consumer).clear_listener();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id.to_string())
            .field("ack_mode", &self.inner.ack_mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        self.connection.check_usable()?;
        if *self.state.lock().expect("session state poisoned") != SessionState::Open {
            return Err(MessagingError::illegal_state("session is closed"));
        }
        Ok(())
    }

    pub(crate) fn attached_lifecycle(&self) -> Option<Arc<ResourceLifecycleManager>> {
        self.lifecycle
            .lock()
            .expect("lifecycle poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// The open unit of work, if any.
    pub(crate) fn current_transaction(&self) -> Option<TransactionId> {
        self.transaction.lock().expect("transaction poisoned").clone()
    }

    /// Join the open unit of work, beginning one at the broker first if
    /// none is open.
    pub(crate) async fn ensure_transaction(&self) -> Result<TransactionId> {
        if let Some(transaction_id) = self.current_transaction() {
            return Ok(transaction_id);
        }
        let transaction_id = self.connection.ids.next_transaction_id();
        let begin = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: self.connection.info.connection_id.clone(),
            transaction_id: transaction_id.clone(),
            operation_type: TransactionOperation::Begin,
        }));
        self.connection.transport.oneway(begin).await?;
        *self.transaction.lock().expect("transaction poisoned") = Some(transaction_id.clone());
        Ok(transaction_id)
    }

    fn clear_transaction(&self) {
        self.transaction
            .lock()
            .expect("transaction poisoned")
            .take();
    }

    fn live_consumers(&self) -> Vec<Arc<ConsumerInner>> {
        self.consumers
            .lock()
            .expect("consumer list poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn live_producers(&self) -> Vec<Arc<ProducerInner>> {
        self.producers
            .lock()
            .expect("producer list poisoned")
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
