//! Consumer delivery.
//!
//! Each consumer owns a bounded inbound queue sized by its prefetch
//! credit. Messages arrive in broker order through the connection's
//! routing table and leave either synchronously via the `receive` family
//! or asynchronously via a dispatch task that invokes the registered
//! listener under the session's dispatch gate. Acknowledgement follows the
//! session's mode: immediate for auto, batched for dups-ok, explicit for
//! client, and deferred to `commit`/`rollback` for transacted sessions.
//! With a prefetch of zero the consumer is in pull mode and every receive
//! asks the broker for exactly one message.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

use crate::command::{
    AckType, BrokerMessage, Command, CommandBody, ConsumerId, ConsumerInfo, MessageAck,
    MessageId, MessagePull, RemovedEntity, TransactionId,
};
use crate::connection::DispatchState;
use crate::destination::Destination;
use crate::error::{MessagingError, Result};
use crate::session::{AckMode, SessionInner};

/// Default broker push credit for new consumers.
pub const DEFAULT_PREFETCH: i32 = 1000;

/// Lazy acknowledgement batch bounds: flush after this many messages or
/// after the window has been open this long, whichever comes first.
const DUPS_OK_BATCH_COUNT: i32 = 64;
const DUPS_OK_BATCH_WINDOW: Duration = Duration::from_secs(1);

/// Options applied when registering a consumer.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Broker-evaluated message selector.
    pub selector: Option<String>,
    /// Suppress messages published on the same connection.
    pub no_local: bool,
    /// Push credit; zero selects pull mode.
    pub prefetch: i32,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            selector: None,
            no_local: false,
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

/// Asynchronous message callback.
///
/// Errors returned here are routed to the connection's exception listener;
/// dispatch continues with the next message.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Handle one delivered message.
    async fn on_message(&self, message: ReceivedMessage) -> Result<()>;
}

/// A message as handed to application code.
///
/// Dereferences to the [`BrokerMessage`] value; [`acknowledge`] covers all
/// messages delivered on the same consumer, per client-acknowledge
/// semantics.
///
/// [`acknowledge`]: ReceivedMessage::acknowledge
pub struct ReceivedMessage {
    message: BrokerMessage,
    consumer: Weak<ConsumerInner>,
}

impl ReceivedMessage {
    /// Acknowledge every message delivered on this consumer so far.
    ///
    /// A no-op outside client-acknowledge mode.
    pub async fn acknowledge(&self) -> Result<()> {
        let Some(consumer) = self.consumer.upgrade() else {
            return Err(MessagingError::illegal_state("consumer closed"));
        };
        MessageConsumer { inner: consumer }.acknowledge().await
    }

    /// Take ownership of the message value.
    #[must_use]
    pub fn into_message(self) -> BrokerMessage {
        self.message
    }
}

impl Deref for ReceivedMessage {
    type Target = BrokerMessage;

    fn deref(&self) -> &BrokerMessage {
        &self.message
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.message, f)
    }
}

/// A registered broker consumer.
#[derive(Clone)]
pub struct MessageConsumer {
    inner: Arc<ConsumerInner>,
}

pub(crate) struct ConsumerInner {
    info: ConsumerInfo,
    session: Arc<SessionInner>,
    closed: AtomicBool,
    /// Receiver half of the inbound queue; `None` while a listener owns it.
    queue: tokio::sync::Mutex<Option<mpsc::Receiver<BrokerMessage>>>,
    delivered: Mutex<DeliveredWindow>,
    credit: AtomicI32,
    dispatch: watch::Receiver<DispatchState>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

/// Messages delivered but not yet acknowledged, as a contiguous window.
#[derive(Default)]
struct DeliveredWindow {
    first: Option<MessageId>,
    last: Option<MessageId>,
    count: i32,
    opened: Option<Instant>,
}

enum Wait {
    Indefinite,
    NoWait,
    Bounded(Duration),
}

impl MessageConsumer {
    pub(crate) async fn register(
        session: Arc<SessionInner>,
        destination: &Destination,
        options: ConsumerOptions,
    ) -> Result<Self> {
        if options.prefetch < 0 {
            return Err(MessagingError::illegal_argument(
                "prefetch must be non-negative",
            ));
        }
        let consumer_id = session.connection.ids.next_consumer_id(&session.id);
        let info = ConsumerInfo {
            consumer_id: consumer_id.clone(),
            destination: destination.clone(),
            prefetch_size: options.prefetch,
            selector: options.selector,
            no_local: options.no_local,
        };

        // Route inbound messages before the broker can push any.
        let capacity = usize::try_from(options.prefetch).unwrap_or(0).max(1);
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        session.connection.routing.insert(consumer_id.clone(), queue_tx);

        let command = Command::new(CommandBody::ConsumerInfo(info.clone()));
        if let Err(error) = session.connection.register_entity(command).await {
            session.connection.routing.remove(&consumer_id);
            return Err(error);
        }

        let dispatch = session.connection.dispatch_watch();
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                info,
                session,
                closed: AtomicBool::new(false),
                queue: tokio::sync::Mutex::new(Some(queue_rx)),
                delivered: Mutex::new(DeliveredWindow::default()),
                credit: AtomicI32::new(options.prefetch),
                dispatch,
                listener_task: Mutex::new(None),
            }),
        })
    }

    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConsumerInner> {
        Arc::downgrade(&self.inner)
    }

    /// Identity of this consumer.
    #[must_use]
    pub fn id(&self) -> &ConsumerId {
        &self.inner.info.consumer_id
    }

    /// The destination this consumer is subscribed to.
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.inner.info.destination
    }

    /// Remaining prefetch credit: delivered-but-unacknowledged messages
    /// reduce it, acknowledgements restore it.
    #[must_use]
    pub fn available_credit(&self) -> i32 {
        self.inner.credit.load(Ordering::SeqCst)
    }

    /// True once [`close`](Self::close) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Block until a message arrives.
    ///
    /// Unblocks with [`MessagingError::IllegalState`] if the consumer or
    /// connection closes, and with [`MessagingError::Transport`] if the
    /// transport fails while waiting.
    pub async fn receive(&self) -> Result<ReceivedMessage> {
        match self.dequeue(Wait::Indefinite).await? {
            Some(message) => Ok(message),
            None => Err(self.inner.closed_error()),
        }
    }

    /// Wait up to `wait` for a message; `None` on expiry.
    pub async fn receive_timeout(&self, wait: Duration) -> Result<Option<ReceivedMessage>> {
        self.dequeue(Wait::Bounded(wait)).await
    }

    /// Return a queued message immediately, or `None`.
    pub async fn receive_no_wait(&self) -> Result<Option<ReceivedMessage>> {
        self.dequeue(Wait::NoWait).await
    }

    async fn dequeue(&self, wait: Wait) -> Result<Option<ReceivedMessage>> {
        self.inner.check_open()?;

        if self.inner.info.prefetch_size == 0 {
            self.inner.issue_pull(&wait).await?;
        }

        let mut guard = self.inner.queue.lock().await;
        let Some(queue) = guard.as_mut() else {
            return Err(MessagingError::illegal_state(
                "receive is unavailable while a message listener is attached",
            ));
        };

        let message = match wait {
            Wait::NoWait => {
                if *self.inner.dispatch.borrow() != DispatchState::Started {
                    return Ok(None);
                }
                match queue.try_recv() {
                    Ok(message) => Some(message),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(self.inner.closed_error())
                    }
                }
            }
            Wait::Indefinite => {
                self.inner.wait_started().await?;
                match queue.recv().await {
                    Some(message) => Some(message),
                    None => return Err(self.inner.closed_error()),
                }
            }
            Wait::Bounded(wait) => {
                let attempt = async {
                    self.inner.wait_started().await?;
                    match queue.recv().await {
                        Some(message) => Ok(Some(message)),
                        None => Err(self.inner.closed_error()),
                    }
                };
                match timeout(wait, attempt).await {
                    Err(_) => None,
                    Ok(outcome) => outcome?,
                }
            }
        };
        drop(guard);

        match message {
            Some(message) => {
                self.inner.record_delivery(&message);
                let received = ReceivedMessage {
                    message,
                    consumer: Arc::downgrade(&self.inner),
                };
                self.inner.auto_ack().await?;
                Ok(Some(received))
            }
            None => Ok(None),
        }
    }

    /// Attach a listener and start asynchronous dispatch.
    ///
    /// # Errors
    ///
    /// [`MessagingError::IllegalState`] if a listener is already attached.
    pub async fn set_message_listener(
        &self,
        listener: impl MessageListener + 'static,
    ) -> Result<()> {
        self.inner.check_open()?;
        let queue = {
            let mut guard = self.inner.queue.lock().await;
            guard.take().ok_or_else(|| {
                MessagingError::illegal_state("a message listener is already attached")
            })?
        };
        let task = tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            queue,
            Arc::new(listener),
        ));
        *self
            .inner
            .listener_task
            .lock()
            .expect("listener task poisoned") = Some(task);
        Ok(())
    }

    /// Acknowledge the whole delivered window (client-acknowledge mode).
    ///
    /// A no-op in other modes, where acknowledgement is automatic.
    pub async fn acknowledge(&self) -> Result<()> {
        if self.inner.session.ack_mode == AckMode::Client {
            self.inner.acknowledge_window(AckType::Standard, None).await
        } else {
            Ok(())
        }
    }

    pub(crate) async fn complete_transaction(
        &self,
        commit: bool,
        transaction_id: &TransactionId,
    ) -> Result<()> {
        let ack_type = if commit {
            AckType::Standard
        } else {
            AckType::Redelivered
        };
        self.inner
            .acknowledge_window(ack_type, Some(transaction_id.clone()))
            .await
    }

    pub(crate) fn clear_listener(&self) {
        self.inner.clear_listener();
    }

    pub(crate) fn has_unacked(&self) -> bool {
        self.inner.has_unacked()
    }

    /// Close the consumer: stop dispatch, drop queued messages, release
    /// the broker registration. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.inner.session.ack_mode == AckMode::DupsOk {
            if let Err(error) = self.inner.acknowledge_window(AckType::Standard, None).await {
                log::warn!("absorbing lazy acknowledge failure on close: {error}");
            }
        }
        self.inner.clear_listener();
        self.inner
            .session
            .connection
            .routing
            .remove(&self.inner.info.consumer_id);
        // Drain whatever the broker pushed but nothing consumed.
        self.inner.queue.lock().await.take();

        self.inner
            .session
            .connection
            .remove_entity(RemovedEntity::Consumer(self.inner.info.consumer_id.clone()))
            .await?;
        log::debug!("consumer {} closed", self.inner.info.consumer_id);
        Ok(())
    }
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("id", &self.inner.info.consumer_id.to_string())
            .field("destination", &self.inner.info.destination.to_string())
            .field("prefetch", &self.inner.info.prefetch_size)
            .finish_non_exhaustive()
    }
}

impl ConsumerInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::illegal_state("consumer is closed"));
        }
        self.session.connection.check_usable()
    }

    fn closed_error(&self) -> MessagingError {
        match self.session.connection.failure() {
            Some(reason) => MessagingError::transport(reason),
            None => MessagingError::illegal_state("consumer closed while receiving"),
        }
    }

    /// Park until dispatch is running, waking with an error when the
    /// connection is gone.
    async fn wait_started(&self) -> Result<()> {
        let mut dispatch = self.dispatch.clone();
        let state = dispatch
            .wait_for(|state| *state != DispatchState::Stopped)
            .await
            .map(|state| *state)
            .map_err(|_| self.closed_error())?;
        if state == DispatchState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    async fn issue_pull(&self, wait: &Wait) -> Result<()> {
        let timeout_millis = match wait {
            Wait::Indefinite => -1,
            Wait::NoWait => 0,
            Wait::Bounded(wait) => i64::try_from(wait.as_millis()).unwrap_or(i64::MAX),
        };
        let pull = MessagePull {
            consumer_id: self.info.consumer_id.clone(),
            destination: self.info.destination.clone(),
            timeout: timeout_millis,
            correlation_id: None,
            message_id: None,
        };
        self.session
            .connection
            .transport
            .oneway(Command::new(CommandBody::MessagePull(pull)))
            .await
    }

    fn record_delivery(&self, message: &BrokerMessage) {
        let mut window = self.delivered.lock().expect("delivered window poisoned");
        if window.first.is_none() {
            window.first = message.message_id.clone();
            window.opened = Some(Instant::now());
        }
        window.last = message.message_id.clone();
        window.count += 1;
        self.credit.fetch_sub(1, Ordering::SeqCst);
    }

    /// Emit the acknowledgement the session's mode calls for after a
    /// delivery, if any.
    async fn auto_ack(&self) -> Result<()> {
        match self.session.ack_mode {
            AckMode::Auto => self.acknowledge_window(AckType::Standard, None).await,
            AckMode::DupsOk => {
                let due = {
                    let window = self.delivered.lock().expect("delivered window poisoned");
                    window.count >= DUPS_OK_BATCH_COUNT
                        || window
                            .opened
                            .is_some_and(|opened| opened.elapsed() >= DUPS_OK_BATCH_WINDOW)
                };
                if due {
                    self.acknowledge_window(AckType::Standard, None).await
                } else {
                    Ok(())
                }
            }
            AckMode::Client | AckMode::Transacted => Ok(()),
        }
    }

    async fn acknowledge_window(
        &self,
        ack_type: AckType,
        transaction_id: Option<TransactionId>,
    ) -> Result<()> {
        let window = {
            let mut window = self.delivered.lock().expect("delivered window poisoned");
            if window.count == 0 {
                return Ok(());
            }
            std::mem::take(&mut *window)
        };
        let ack = MessageAck {
            consumer_id: self.info.consumer_id.clone(),
            destination: Some(self.info.destination.clone()),
            ack_type,
            first_message_id: window.first,
            last_message_id: window.last,
            message_count: window.count,
            transaction_id,
        };
        self.session
            .connection
            .transport
            .oneway(Command::new(CommandBody::MessageAck(ack)))
            .await?;
        self.credit.fetch_add(window.count, Ordering::SeqCst);
        Ok(())
    }

    fn has_unacked(&self) -> bool {
        self.delivered
            .lock()
            .expect("delivered window poisoned")
            .count
            > 0
    }

    fn clear_listener(&self) {
        let task = self
            .listener_task
            .lock()
            .expect("listener task poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Pop messages and invoke the listener, serialized with every other
/// consumer of the same session. Listener failures are routed to the
/// exception listener; dispatch continues.
async fn dispatch_loop(
    inner: Arc<ConsumerInner>,
    mut queue: mpsc::Receiver<BrokerMessage>,
    listener: Arc<dyn MessageListener>,
) {
    loop {
        let mut dispatch = inner.dispatch.clone();
        match dispatch
            .wait_for(|state| *state != DispatchState::Stopped)
            .await
        {
            Ok(state) if *state == DispatchState::Closed => return,
            Ok(_) => {}
            Err(_) => return,
        }
        let Some(message) = queue.recv().await else {
            return;
        };
        let gate = Arc::clone(&inner.session.dispatch_gate);
        let serialized = gate.lock().await;
        inner.record_delivery(&message);
        let received = ReceivedMessage {
            message,
            consumer: Arc::downgrade(&inner),
        };
        if let Err(error) = listener.on_message(received).await {
            inner.session.connection.notify_exception(&error);
        }
        drop(serialized);
        if let Err(error) = inner.auto_ack().await {
            inner.session.connection.notify_exception(&error);
            if error.is_fatal() {
                return;
            }
        }
    }
}
