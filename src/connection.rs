//! Connection lifecycle and inbound routing.
//!
//! A [`Connection`] owns the transport, the correlation table, the set of
//! sessions created under it, and the temporary destinations it minted.
//! Inbound data messages are routed to consumers through a concurrent
//! table keyed by consumer id; lifecycle transitions gate consumer
//! dispatch through a watch channel so `stop()` suspends delivery without
//! tearing anything down.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use crate::command::{
    next_connection_id, BrokerMessage, Command, CommandBody, ConnectionId, ConnectionInfo,
    ConsumerId, DestinationInfo, DestinationOperation, IdGenerator, RemoveInfo, RemovedEntity,
    Response, SessionInfo, ShutdownInfo,
};
use crate::destination::{Destination, DestinationKind};
use crate::error::{MessagingError, Result};
use crate::session::{AckMode, Session, SessionInner};
use crate::transport::failover::RecoveryState;
use crate::transport::{self, TransportConfig, TransportEvent, TransportHandle};
use crate::uri::{BrokerUri, UriOptions};

/// Callback invoked with failures that have no caller to land on.
pub type ExceptionListener = dyn Fn(&MessagingError) + Send + Sync;

/// Consumer dispatch gate, broadcast to every consumer of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DispatchState {
    /// Delivery suspended; receives park.
    Stopped,
    /// Delivery running.
    Started,
    /// The connection is gone; parked receives must wake with an error.
    Closed,
}

/// Creates [`Connection`]s for one broker URI.
#[derive(Clone, Debug)]
pub struct ConnectionFactory {
    uri: BrokerUri,
    user_name: String,
    password: String,
    client_id: String,
}

impl ConnectionFactory {
    /// Parse `uri` and build a factory.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::IllegalArgument`] for a malformed URI.
    pub fn new(uri: &str) -> Result<Self> {
        Ok(Self {
            uri: BrokerUri::parse(uri)?,
            user_name: String::new(),
            password: String::new(),
            client_id: String::new(),
        })
    }

    /// Authenticate as `user_name`/`password` instead of anonymously.
    #[must_use]
    pub fn with_credentials(
        mut self,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.user_name = user_name.into();
        self.password = password.into();
        self
    }

    /// Set the administratively meaningful client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Dial the broker and return a connection in the created state.
    ///
    /// The connection does not dispatch messages until
    /// [`Connection::start`] is called.
    pub async fn create_connection(&self) -> Result<Connection> {
        let connection_id = next_connection_id();
        let config = TransportConfig {
            uri: self.uri.clone(),
            connection_id: connection_id.clone(),
            client_id: self.client_id.clone(),
            user_name: self.user_name.clone(),
            password: self.password.clone(),
        };
        let (transport, events, recovery) = transport::connect(config).await?;

        let (dispatch_tx, _) = watch::channel(DispatchState::Stopped);
        let inner = Arc::new(ConnectionInner {
            info: ConnectionInfo {
                connection_id: connection_id.clone(),
                client_id: self.client_id.clone(),
                user_name: self.user_name.clone(),
                password: self.password.clone(),
            },
            options: self.uri.options.clone(),
            transport,
            recovery,
            ids: IdGenerator::new(connection_id),
            state: Mutex::new(ConnectionState::Created),
            info_sent: AtomicBool::new(false),
            failure: Mutex::new(None),
            dispatch: dispatch_tx,
            routing: DashMap::new(),
            sessions: Mutex::new(Vec::new()),
            temp_destinations: Mutex::new(Vec::new()),
            temp_sequence: AtomicI64::new(0),
            exception_listener: Mutex::new(None),
        });

        tokio::spawn(pump_events(Arc::downgrade(&inner), events));
        log::debug!("connection {} created against {}", inner.info.connection_id, self.uri);
        Ok(Connection { inner })
    }
}

/// Lifecycle states of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialed but not yet dispatching.
    Created,
    /// Registered with the broker and dispatching inbound messages.
    Started,
    /// Dispatch suspended; sessions remain open.
    Stopped,
    /// Terminal.
    Closed,
}

/// A live broker connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) info: ConnectionInfo,
    pub(crate) options: UriOptions,
    pub(crate) transport: TransportHandle,
    pub(crate) recovery: Arc<RecoveryState>,
    pub(crate) ids: IdGenerator,
    state: Mutex<ConnectionState>,
    info_sent: AtomicBool,
    failure: Mutex<Option<String>>,
    dispatch: watch::Sender<DispatchState>,
    pub(crate) routing: DashMap<ConsumerId, mpsc::Sender<BrokerMessage>>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    temp_destinations: Mutex<Vec<Destination>>,
    temp_sequence: AtomicI64,
    exception_listener: Mutex<Option<Box<ExceptionListener>>>,
}

impl Connection {
    /// The identity this connection registered with the broker.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.info.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("connection state poisoned")
    }

    /// Register with the broker and begin dispatching inbound messages.
    ///
    /// Idempotent once started.
    pub async fn start(&self) -> Result<()> {
        self.inner.check_usable()?;
        if self.state() == ConnectionState::Started {
            return Ok(());
        }
        if !self.inner.info_sent.swap(true, Ordering::SeqCst) {
            let command = Command::new(CommandBody::ConnectionInfo(self.inner.info.clone()));
            match self
                .inner
                .transport
                .request(command.clone(), self.inner.options.request_timeout)
                .await
            {
                Ok(_) => {
                    if self.inner.transport.supports(&command) {
                        self.inner.recovery.record(command);
                    }
                }
                Err(error) => {
                    self.inner.info_sent.store(false, Ordering::SeqCst);
                    return Err(error);
                }
            }
        }
        self.inner.set_state(ConnectionState::Started);
        let _ = self.inner.dispatch.send(DispatchState::Started);
        log::debug!("connection {} started", self.id());
        Ok(())
    }

    /// Suspend consumer dispatch, leaving every session open.
    ///
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.inner.check_usable()?;
        if self.state() == ConnectionState::Stopped {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Stopped);
        let _ = self.inner.dispatch.send(DispatchState::Stopped);
        log::debug!("connection {} stopped", self.id());
        Ok(())
    }

    /// Create a session carrying `ack_mode`.
    pub async fn create_session(&self, ack_mode: AckMode) -> Result<Session> {
        self.inner.check_usable()?;
        let session_id = self.inner.ids.next_session_id();
        let command = Command::new(CommandBody::SessionInfo(SessionInfo {
            session_id: session_id.clone(),
        }));
        self.inner.register_entity(command).await?;

        let session = Session::register(Arc::clone(&self.inner), session_id, ack_mode);
        self.inner
            .sessions
            .lock()
            .expect("session list poisoned")
            .push(session.downgrade());
        Ok(session)
    }

    /// Route listener failures and transport faults somewhere visible.
    pub fn set_exception_listener(
        &self,
        listener: impl Fn(&MessagingError) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .exception_listener
            .lock()
            .expect("exception listener poisoned") = Some(Box::new(listener));
    }

    /// Close the connection: stop dispatch, close every session, announce
    /// shutdown to the broker, and drop the transport.
    ///
    /// Idempotent; any later operation fails with
    /// [`MessagingError::IllegalState`].
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("connection state poisoned");
            if *state == ConnectionState::Closed {
                return Ok(());
            }
            *state = ConnectionState::Closed;
        }
        let _ = self.inner.dispatch.send(DispatchState::Closed);

        let sessions: Vec<Weak<SessionInner>> = {
            let mut list = self.inner.sessions.lock().expect("session list poisoned");
            std::mem::take(&mut *list)
        };
        for weak in sessions {
            if let Some(session) = weak.upgrade() {
                if let Err(error) = Session::from_inner(session).close().await {
                    log::warn!("absorbing session close failure: {error}");
                }
            }
        }

        let temporaries: Vec<Destination> = {
            let mut list = self
                .inner
                .temp_destinations
                .lock()
                .expect("temp destination list poisoned");
            std::mem::take(&mut *list)
        };
        for destination in temporaries {
            if let Err(error) = self.inner.remove_destination(&destination).await {
                log::warn!("absorbing temporary destination removal failure: {error}");
            }
        }

        let shutdown = Command::new(CommandBody::ShutdownInfo(ShutdownInfo));
        match self
            .inner
            .transport
            .request(shutdown, self.inner.options.close_timeout)
            .await
        {
            Ok(_) => {}
            Err(MessagingError::Timeout) => {
                log::warn!("broker did not acknowledge shutdown in time, closing abruptly");
            }
            Err(error) => log::debug!("absorbing shutdown announce failure: {error}"),
        }
        self.inner.transport.close();
        self.inner.routing.clear();
        log::debug!("connection {} closed", self.id());
        Ok(())
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.info.connection_id.value)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    /// Reject use of a connection that is closed or has lost its transport.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if let Some(reason) = self
            .failure
            .lock()
            .expect("failure flag poisoned")
            .as_deref()
        {
            // A dead transport surfaces as closed on the next user op.
            self.set_state(ConnectionState::Closed);
            return Err(MessagingError::transport(reason.to_owned()));
        }
        let state = *self.state.lock().expect("connection state poisoned");
        if state == ConnectionState::Closed {
            return Err(MessagingError::illegal_state("connection is closed"));
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().expect("connection state poisoned") = next;
    }

    /// Watch over the consumer dispatch gate.
    pub(crate) fn dispatch_watch(&self) -> watch::Receiver<DispatchState> {
        self.dispatch.subscribe()
    }

    /// The failure reason, when the transport has permanently failed.
    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.lock().expect("failure flag poisoned").clone()
    }

    pub(crate) fn notify_exception(&self, error: &MessagingError) {
        let listener = self
            .exception_listener
            .lock()
            .expect("exception listener poisoned");
        match listener.as_ref() {
            Some(listener) => listener(error),
            None => log::warn!("unhandled asynchronous error: {error}"),
        }
    }

    /// Create a broker-side temporary destination owned by this connection.
    pub(crate) async fn create_temporary_destination(
        &self,
        kind: DestinationKind,
    ) -> Result<Destination> {
        self.check_usable()?;
        let sequence = self.temp_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}:{sequence}", self.info.connection_id);
        let destination = Destination::temporary(kind, name);
        let command = Command::new(CommandBody::DestinationInfo(DestinationInfo {
            connection_id: self.info.connection_id.clone(),
            destination: destination.clone(),
            operation_type: DestinationOperation::Add,
            timeout: 0,
            broker_path: Vec::new(),
        }));
        self.transport
            .request(command, self.options.request_timeout)
            .await?;
        self.temp_destinations
            .lock()
            .expect("temp destination list poisoned")
            .push(destination.clone());
        Ok(destination)
    }

    /// Remove a temporary destination this connection still tracks.
    ///
    /// No-op when the destination was already removed through another
    /// path, so the connection's own close and a lifecycle sweep never
    /// release the same handle twice.
    pub(crate) async fn remove_temporary_destination(
        &self,
        destination: &Destination,
    ) -> Result<()> {
        let tracked = {
            let mut list = self
                .temp_destinations
                .lock()
                .expect("temp destination list poisoned");
            match list.iter().position(|tracked| tracked == destination) {
                Some(index) => {
                    list.remove(index);
                    true
                }
                None => false,
            }
        };
        if !tracked {
            return Ok(());
        }
        self.remove_destination(destination).await
    }

    /// Remove a destination at the broker.
    pub(crate) async fn remove_destination(&self, destination: &Destination) -> Result<()> {
        let command = Command::new(CommandBody::DestinationInfo(DestinationInfo {
            connection_id: self.info.connection_id.clone(),
            destination: destination.clone(),
            operation_type: DestinationOperation::Remove,
            timeout: 0,
            broker_path: Vec::new(),
        }));
        self.transport
            .request(command, self.options.request_timeout)
            .await?;
        Ok(())
    }

    /// Issue a registration request and record it for failover replay.
    ///
    /// Commands the wire format answers locally are not recorded; there
    /// is nothing to replay for them.
    pub(crate) async fn register_entity(&self, command: Command) -> Result<Response> {
        let response = self
            .transport
            .request(command.clone(), self.options.request_timeout)
            .await?;
        if self.transport.supports(&command) {
            self.recovery.record(command);
        }
        Ok(response)
    }

    /// Release a broker registration and forget its replay record.
    pub(crate) async fn remove_entity(&self, entity: RemovedEntity) -> Result<()> {
        self.recovery.forget(&entity);
        let command = Command::new(CommandBody::RemoveInfo(RemoveInfo { object: entity }));
        self.transport
            .request(command, self.options.request_timeout)
            .await?;
        Ok(())
    }

    fn on_transport_failed(&self, reason: String) {
        log::warn!(
            "connection {} lost its transport: {reason}",
            self.info.connection_id
        );
        *self.failure.lock().expect("failure flag poisoned") = Some(reason.clone());
        let _ = self.dispatch.send(DispatchState::Closed);
        // Dropping the routing senders wakes pending receives.
        self.routing.clear();
        self.notify_exception(&MessagingError::transport(reason));
    }

    async fn handle_inbound(&self, command: Command) {
        match command.body {
            CommandBody::Message(message) => {
                let Some(consumer_id) = message.target_consumer_id.clone() else {
                    log::warn!("dropping inbound message without a target consumer");
                    return;
                };
                let sender = self
                    .routing
                    .get(&consumer_id)
                    .map(|entry| entry.value().clone());
                match sender {
                    Some(sender) => {
                        if sender.send(message).await.is_err() {
                            log::debug!("consumer {consumer_id} gone, dropping message");
                        }
                    }
                    None => log::warn!("no consumer registered for {consumer_id}"),
                }
            }
            CommandBody::ShutdownInfo(_) => {
                self.on_transport_failed("broker announced shutdown".to_owned());
            }
            CommandBody::ConsumerControl(control) => {
                log::debug!(
                    "broker consumer control for {}: close={} start={} stop={}",
                    control.consumer_id,
                    control.close,
                    control.start,
                    control.stop
                );
            }
            other => log::debug!("ignoring inbound {other:?}"),
        }
    }
}

/// Forward transport events into connection state until either side goes
/// away. Holding only a weak reference lets a dropped connection unwind.
async fn pump_events(
    connection: Weak<ConnectionInner>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = connection.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Command(command) => inner.handle_inbound(command).await,
            TransportEvent::Interrupted => {
                log::debug!(
                    "transport for {} interrupted, reconnecting",
                    inner.info.connection_id
                );
            }
            TransportEvent::Resumed => {
                log::debug!("transport for {} resumed", inner.info.connection_id);
            }
            TransportEvent::Failed(reason) => inner.on_transport_failed(reason),
        }
    }
}
