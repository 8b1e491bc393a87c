//! Producer side of the data plane.
//!
//! Producers are stateless beyond their send defaults. Every send stamps
//! the message with the next sequence-derived id (unless disabled), the
//! send timestamp, and the effective quality of service, then submits the
//! command through the transport. With `transport.useAsyncSend` the send
//! is fire-and-forget; otherwise it awaits the broker's acknowledgement.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Duration;

use crate::command::{
    BrokerMessage, Command, CommandBody, DeliveryMode, MessageId, ProducerId, ProducerInfo,
    RemovedEntity, DEFAULT_PRIORITY,
};
use crate::destination::Destination;
use crate::error::{MessagingError, Result};
use crate::session::{AckMode, SessionInner};

/// Quality of service applied to a send.
#[derive(Clone, Copy, Debug)]
pub struct SendQos {
    /// Persistence of the message.
    pub delivery_mode: DeliveryMode,
    /// Priority in 0..=9.
    pub priority: u8,
    /// Lifetime after send; zero means no expiry.
    pub time_to_live: Duration,
}

impl Default for SendQos {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SendDefaults {
    qos: SendQos,
    disable_message_id: bool,
    disable_message_timestamp: bool,
}

/// A registered broker producer.
#[derive(Clone)]
pub struct MessageProducer {
    inner: Arc<ProducerInner>,
}

pub(crate) struct ProducerInner {
    info: ProducerInfo,
    session: Arc<SessionInner>,
    sequence: AtomicI64,
    closed: AtomicBool,
    defaults: Mutex<SendDefaults>,
}

impl MessageProducer {
    pub(crate) fn register(session: Arc<SessionInner>, info: ProducerInfo) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                info,
                session,
                sequence: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                defaults: Mutex::new(SendDefaults {
                    qos: SendQos::default(),
                    disable_message_id: false,
                    disable_message_timestamp: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ProducerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProducerInner> {
        Arc::downgrade(&self.inner)
    }

    /// Identity of this producer.
    #[must_use]
    pub fn id(&self) -> &ProducerId {
        &self.inner.info.producer_id
    }

    /// The default destination, when the producer is bound.
    #[must_use]
    pub fn destination(&self) -> Option<&Destination> {
        self.inner.info.destination.as_ref()
    }

    /// True once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Replace the default quality of service for plain sends.
    pub fn set_default_qos(&self, qos: SendQos) {
        self.inner.defaults.lock().expect("defaults poisoned").qos = qos;
    }

    /// Skip stamping message ids on send.
    pub fn set_disable_message_id(&self, disable: bool) {
        self.inner
            .defaults
            .lock()
            .expect("defaults poisoned")
            .disable_message_id = disable;
    }

    /// Skip stamping send timestamps.
    pub fn set_disable_message_timestamp(&self, disable: bool) {
        self.inner
            .defaults
            .lock()
            .expect("defaults poisoned")
            .disable_message_timestamp = disable;
    }

    /// Send to the default destination with the default quality of service.
    ///
    /// # Errors
    ///
    /// [`MessagingError::IllegalState`] when the producer has no default
    /// destination.
    pub async fn send(&self, message: BrokerMessage) -> Result<()> {
        self.do_send(None, message, None).await
    }

    /// Send to an explicit destination with the default quality of service.
    pub async fn send_to(&self, destination: &Destination, message: BrokerMessage) -> Result<()> {
        self.do_send(Some(destination), message, None).await
    }

    /// Send to the default destination with explicit quality of service.
    pub async fn send_with(&self, message: BrokerMessage, qos: SendQos) -> Result<()> {
        self.do_send(None, message, Some(qos)).await
    }

    /// Send to an explicit destination with explicit quality of service.
    pub async fn send_to_with(
        &self,
        destination: &Destination,
        message: BrokerMessage,
        qos: SendQos,
    ) -> Result<()> {
        self.do_send(Some(destination), message, Some(qos)).await
    }

    async fn do_send(
        &self,
        destination: Option<&Destination>,
        mut message: BrokerMessage,
        qos: Option<SendQos>,
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::illegal_state("producer is closed"));
        }
        self.inner.session.check_open()?;

        let destination = match destination.or(self.inner.info.destination.as_ref()) {
            Some(destination) => destination.clone(),
            None => {
                return Err(MessagingError::illegal_state(
                    "send requires a destination: none given and no default configured",
                ))
            }
        };
        let defaults = *self.inner.defaults.lock().expect("defaults poisoned");
        let qos = qos.unwrap_or(defaults.qos);

        // Transacted sends join the session's open unit of work.
        message.transaction_id = if self.inner.session.ack_mode == AckMode::Transacted {
            Some(self.inner.session.ensure_transaction().await?)
        } else {
            None
        };
        message.destination = Some(destination);
        message.delivery_mode = qos.delivery_mode;
        message.priority = qos.priority.min(9);
        if !defaults.disable_message_id {
            let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            message.message_id = Some(MessageId {
                producer_id: self.inner.info.producer_id.clone(),
                producer_sequence_id: sequence,
            });
        }
        let now = now_millis();
        if !defaults.disable_message_timestamp {
            message.timestamp = now;
        }
        message.expiration = if qos.time_to_live.is_zero() {
            0
        } else {
            now + i64::try_from(qos.time_to_live.as_millis()).unwrap_or(i64::MAX)
        };

        let command = Command::new(CommandBody::Message(message));
        let transport = &self.inner.session.connection.transport;
        if self.inner.session.connection.options.use_async_send {
            transport.oneway(command).await
        } else {
            transport
                .request(command, self.inner.session.connection.options.request_timeout)
                .await
                .map(|_| ())
        }
    }

    /// Release the broker registration. Idempotent; messages already sent
    /// are unaffected.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .session
            .connection
            .remove_entity(RemovedEntity::Producer(self.inner.info.producer_id.clone()))
            .await?;
        log::debug!("producer {} closed", self.inner.info.producer_id);
        Ok(())
    }
}

impl std::fmt::Debug for MessageProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProducer")
            .field("id", &self.inner.info.producer_id.to_string())
            .finish_non_exhaustive()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
