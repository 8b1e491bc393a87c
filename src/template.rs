//! Send/receive template over pooled sessions.
//!
//! The template scopes every broker interaction: it borrows a session
//! from the acknowledgement-mode pool, runs the caller's callback, and
//! guarantees the session goes back — and any producer or consumer the
//! template created is destroyed — on both the normal and the error
//! path. Errors raised inside a callback are augmented with the
//! operation that was running before being re-raised.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::time::Duration;

use crate::command::BrokerMessage;
use crate::connection::{Connection, ConnectionFactory};
use crate::consumer::{ConsumerOptions, MessageConsumer, ReceivedMessage};
use crate::destination::Destination;
use crate::error::{MessagingError, Result};
use crate::lifecycle::ResourceLifecycleManager;
use crate::pool::{PooledSession, SessionPools};
use crate::producer::{MessageProducer, SendQos};
use crate::session::{AckMode, Session};

/// How long template receives wait for a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// Block until a message arrives or the connection shuts down.
    #[default]
    Indefinite,
    /// Poll: return immediately when nothing is queued.
    NoWait,
    /// Wait at most this many milliseconds.
    Millis(u64),
}

/// Callback run against a borrowed session.
#[async_trait]
pub trait SessionCallback: Send + Sync {
    /// Do work with the session. The session goes back to the pool when
    /// this returns, on success and on error alike.
    async fn do_in_session(&self, session: &Session) -> Result<()>;
}

/// Callback run against a borrowed session and a template-created
/// producer.
#[async_trait]
pub trait ProducerCallback: Send + Sync {
    /// Do work with the producer. The producer is destroyed when this
    /// returns, on success and on error alike.
    async fn do_in_producer(&self, session: &Session, producer: &MessageProducer) -> Result<()>;
}

/// Builds the message to send inside a template `send`.
pub trait MessageCreator: Send + Sync {
    /// Create the message against the borrowed session.
    fn create_message(&self, session: &Session) -> Result<BrokerMessage>;
}

impl<F> MessageCreator for F
where
    F: Fn(&Session) -> Result<BrokerMessage> + Send + Sync,
{
    fn create_message(&self, session: &Session) -> Result<BrokerMessage> {
        self(session)
    }
}

/// High-level send/receive helper with pooled sessions and guaranteed
/// resource reclamation.
pub struct MessagingTemplate {
    factory: ConnectionFactory,
    ack_mode: AckMode,
    default_destination: Option<Destination>,
    default_destination_name: Option<String>,
    pub_sub_domain: bool,
    explicit_qos_enabled: bool,
    qos: SendQos,
    message_id_enabled: bool,
    message_timestamp_enabled: bool,
    no_local: bool,
    receive_timeout: ReceiveTimeout,
    lifecycle: Arc<ResourceLifecycleManager>,
    runtime: OnceCell<TemplateRuntime>,
    resolved_default: std::sync::OnceLock<Destination>,
}

struct TemplateRuntime {
    connection: Connection,
    pools: SessionPools,
}

impl MessagingTemplate {
    /// Create a template over `factory` with auto-acknowledge defaults.
    #[must_use]
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            ack_mode: AckMode::Auto,
            default_destination: None,
            default_destination_name: None,
            pub_sub_domain: false,
            explicit_qos_enabled: false,
            qos: SendQos::default(),
            message_id_enabled: true,
            message_timestamp_enabled: true,
            no_local: false,
            receive_timeout: ReceiveTimeout::default(),
            lifecycle: Arc::new(ResourceLifecycleManager::new()),
            runtime: OnceCell::new(),
            resolved_default: std::sync::OnceLock::new(),
        }
    }

    /// Acknowledgement mode for sessions the template borrows.
    #[must_use]
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Destination used when a send or receive names none.
    #[must_use]
    pub fn with_default_destination(mut self, destination: Destination) -> Self {
        self.default_destination = Some(destination);
        self
    }

    /// Like [`with_default_destination`](Self::with_default_destination),
    /// resolved by name on first use.
    #[must_use]
    pub fn with_default_destination_name(mut self, name: impl Into<String>) -> Self {
        self.default_destination_name = Some(name.into());
        self
    }

    /// Resolve bare destination names to topics instead of queues.
    #[must_use]
    pub fn with_pub_sub_domain(mut self, pub_sub_domain: bool) -> Self {
        self.pub_sub_domain = pub_sub_domain;
        self
    }

    /// Apply `qos` explicitly on every template send.
    #[must_use]
    pub fn with_explicit_qos(mut self, qos: SendQos) -> Self {
        self.explicit_qos_enabled = true;
        self.qos = qos;
        self
    }

    /// Suppress message ids on template sends.
    #[must_use]
    pub fn with_message_id_enabled(mut self, enabled: bool) -> Self {
        self.message_id_enabled = enabled;
        self
    }

    /// Suppress send timestamps on template sends.
    #[must_use]
    pub fn with_message_timestamp_enabled(mut self, enabled: bool) -> Self {
        self.message_timestamp_enabled = enabled;
        self
    }

    /// Skip messages published on the template's own connection.
    #[must_use]
    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    /// Wait policy for template receives.
    #[must_use]
    pub fn with_receive_timeout(mut self, receive_timeout: ReceiveTimeout) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Run `callback` with a pooled session.
    ///
    /// The session is returned to its pool on every path; callback errors
    /// are augmented with the origin and re-raised.
    pub async fn execute(&self, callback: &dyn SessionCallback) -> Result<()> {
        let pooled = self.take_session().await?;
        let outcome = callback.do_in_session(pooled.session()).await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("execute(session callback)")),
            Ok(()) => returned,
        }
    }

    /// Run `callback` with a pooled session and a producer bound to the
    /// default destination.
    ///
    /// The producer is destroyed on every path before the session goes
    /// back to the pool.
    pub async fn execute_producer(&self, callback: &dyn ProducerCallback) -> Result<()> {
        let pooled = self.take_session().await?;
        let outcome = self.run_with_producer(pooled.session(), callback).await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("execute(producer callback)")),
            Ok(()) => returned,
        }
    }

    async fn run_with_producer(
        &self,
        session: &Session,
        callback: &dyn ProducerCallback,
    ) -> Result<()> {
        let destination = self.resolve_default_destination(session)?;
        let producer = self.create_producer(session, &destination).await?;
        let outcome = callback.do_in_producer(session, &producer).await;
        let destroyed = producer.close().await;
        outcome.and(destroyed)
    }

    /// Send a message built by `creator` to the default destination.
    ///
    /// # Errors
    ///
    /// [`MessagingError::IllegalState`] when neither a default
    /// destination nor a default destination name is configured.
    pub async fn send(&self, creator: &dyn MessageCreator) -> Result<()> {
        let pooled = self.take_session().await?;
        let outcome = async {
            let destination = self.resolve_default_destination(pooled.session())?;
            self.do_send(pooled.session(), &destination, creator).await
        }
        .await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("send(default destination)")),
            Ok(()) => returned,
        }
    }

    /// Send a message built by `creator` to `destination`.
    pub async fn send_to(
        &self,
        destination: &Destination,
        creator: &dyn MessageCreator,
    ) -> Result<()> {
        let pooled = self.take_session().await?;
        let outcome = self.do_send(pooled.session(), destination, creator).await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("send(destination)")),
            Ok(()) => returned,
        }
    }

    /// Send a message built by `creator` to the destination named `name`.
    pub async fn send_to_name(&self, name: &str, creator: &dyn MessageCreator) -> Result<()> {
        let pooled = self.take_session().await?;
        let outcome = async {
            let destination = self.resolve_name(pooled.session(), name)?;
            self.do_send(pooled.session(), &destination, creator).await
        }
        .await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("send(destination name)")),
            Ok(()) => returned,
        }
    }

    /// Receive one message from the default destination, honoring the
    /// configured receive timeout.
    pub async fn receive(&self) -> Result<Option<ReceivedMessage>> {
        self.receive_selected(None).await
    }

    /// Receive one message from `destination`.
    pub async fn receive_from(&self, destination: &Destination) -> Result<Option<ReceivedMessage>> {
        self.receive_selected_from(destination, None).await
    }

    /// Receive one message matching `selector` from the default
    /// destination.
    pub async fn receive_selected(
        &self,
        selector: Option<&str>,
    ) -> Result<Option<ReceivedMessage>> {
        let pooled = self.take_session().await?;
        let outcome = async {
            let destination = self.resolve_default_destination(pooled.session())?;
            self.do_receive(pooled.session(), &destination, selector)
                .await
        }
        .await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("receive(default destination)")),
            Ok(received) => returned.map(|()| received),
        }
    }

    /// Receive one message matching `selector` from `destination`.
    pub async fn receive_selected_from(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Option<ReceivedMessage>> {
        let pooled = self.take_session().await?;
        let outcome = self
            .do_receive(pooled.session(), destination, selector)
            .await;
        let returned = self.return_session(pooled).await;
        match outcome {
            Err(error) => Err(error.at("receive(destination)")),
            Ok(received) => returned.map(|()| received),
        }
    }

    /// The shared connection, dialed and started on first use.
    pub async fn connection(&self) -> Result<&Connection> {
        Ok(&self.runtime().await?.connection)
    }

    /// Release everything the template created: pooled sessions and the
    /// shared connection, through the resource lifecycle manager.
    ///
    /// The template is unusable afterwards.
    pub async fn destroy(&self) -> Result<()> {
        self.lifecycle.destroy().await
    }

    async fn runtime(&self) -> Result<&TemplateRuntime> {
        self.runtime
            .get_or_try_init(|| async {
                let connection = self.factory.create_connection().await?;
                connection.start().await?;
                self.lifecycle.register_connection(connection.clone());
                let pools = SessionPools::new(&connection, &self.lifecycle);
                Ok::<_, MessagingError>(TemplateRuntime { connection, pools })
            })
            .await
    }

    async fn take_session(&self) -> Result<PooledSession> {
        let runtime = self.runtime().await?;
        runtime.pools.pool(self.ack_mode).take().await
    }

    async fn return_session(&self, pooled: PooledSession) -> Result<()> {
        let runtime = self.runtime().await?;
        runtime.pools.pool(self.ack_mode).give_back(pooled).await
    }

    fn resolve_default_destination(&self, session: &Session) -> Result<Destination> {
        if let Some(destination) = &self.default_destination {
            return Ok(destination.clone());
        }
        if let Some(resolved) = self.resolved_default.get() {
            return Ok(resolved.clone());
        }
        match &self.default_destination_name {
            Some(name) => {
                let destination = self.resolve_name(session, name)?;
                let _ = self.resolved_default.set(destination.clone());
                Ok(destination)
            }
            None => Err(MessagingError::illegal_state(
                "no default destination or default destination name configured",
            )),
        }
    }

    fn resolve_name(&self, session: &Session, name: &str) -> Result<Destination> {
        if self.pub_sub_domain && !name.contains("://") {
            return Ok(Destination::topic(name));
        }
        session.resolve_destination(name)
    }

    async fn create_producer(
        &self,
        session: &Session,
        destination: &Destination,
    ) -> Result<MessageProducer> {
        let producer = session.create_producer(Some(destination)).await?;
        if !self.message_id_enabled {
            producer.set_disable_message_id(true);
        }
        if !self.message_timestamp_enabled {
            producer.set_disable_message_timestamp(true);
        }
        Ok(producer)
    }

    async fn do_send(
        &self,
        session: &Session,
        destination: &Destination,
        creator: &dyn MessageCreator,
    ) -> Result<()> {
        let producer = self.create_producer(session, destination).await?;
        let outcome = async {
            let message = creator.create_message(session)?;
            if self.explicit_qos_enabled {
                producer.send_with(message, self.qos).await
            } else {
                producer.send(message).await
            }
        }
        .await;
        let destroyed = producer.close().await;
        outcome.and(destroyed)
    }

    async fn do_receive(
        &self,
        session: &Session,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Option<ReceivedMessage>> {
        let consumer = session
            .create_consumer_with(
                destination,
                ConsumerOptions {
                    selector: selector.map(str::to_owned),
                    no_local: self.no_local,
                    ..ConsumerOptions::default()
                },
            )
            .await?;
        let outcome = self.bounded_receive(&consumer).await;
        let closed = consumer.close().await;
        match outcome {
            Ok(received) => closed.map(|()| received),
            Err(error) => {
                if let Err(close_error) = closed {
                    log::warn!("absorbing consumer close failure: {close_error}");
                }
                Err(error)
            }
        }
    }

    async fn bounded_receive(&self, consumer: &MessageConsumer) -> Result<Option<ReceivedMessage>> {
        match self.receive_timeout {
            ReceiveTimeout::Indefinite => consumer.receive().await.map(Some),
            ReceiveTimeout::NoWait => consumer.receive_no_wait().await,
            ReceiveTimeout::Millis(millis) => {
                consumer.receive_timeout(Duration::from_millis(millis)).await
            }
        }
    }
}

impl std::fmt::Debug for MessagingTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingTemplate")
            .field("ack_mode", &self.ack_mode)
            .field("default_destination", &self.default_destination)
            .field("explicit_qos_enabled", &self.explicit_qos_enabled)
            .finish_non_exhaustive()
    }
}
