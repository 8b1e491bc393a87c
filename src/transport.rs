//! Layered transport stack.
//!
//! The stack is `TCP ↔ inactivity monitor ↔ wire codec ↔ correlator ↔
//! connection`. A single I/O task per connection owns the socket: it
//! serializes outbound commands from one channel (preserving submission
//! order), resolves responses through the [`Correlator`], and forwards
//! everything else upward as [`TransportEvent`]s. A supervisor wraps the
//! I/O task; with failover enabled it re-dials after fatal errors and
//! replays the recorded entity state before resuming.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Duration};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::codec::{CommandCodec, StompCodec};
use crate::command::{Command, CommandBody, ConnectionId, KeepAlive, Response};
use crate::correlation::Correlator;
use crate::error::{MessagingError, Result};
use crate::uri::{BrokerUri, WireFormatKind};

pub(crate) mod failover;
pub(crate) mod inactivity;
pub(crate) mod tcp;

use failover::{FailoverPolicy, RecoveryState};
use inactivity::InactivityMonitor;

/// Capacity of the outbound writer channel.
const OUTBOUND_CAPACITY: usize = 64;

/// Capacity of the inbound event channel.
const EVENT_CAPACITY: usize = 64;

/// What the connection learns from the transport, beyond responses.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    /// An inbound command that is not a correlated response.
    Command(Command),
    /// The socket failed; reconnection is in progress.
    Interrupted,
    /// Reconnection succeeded and entity state was replayed.
    Resumed,
    /// The transport is permanently down.
    Failed(String),
}

/// Everything needed to dial and identify a connection.
#[derive(Clone, Debug)]
pub(crate) struct TransportConfig {
    pub(crate) uri: BrokerUri,
    pub(crate) connection_id: ConnectionId,
    pub(crate) client_id: String,
    pub(crate) user_name: String,
    pub(crate) password: String,
}

/// Cloneable handle for submitting commands to the I/O task.
#[derive(Clone)]
pub(crate) struct TransportHandle {
    outbound: mpsc::Sender<Command>,
    correlator: Arc<Correlator>,
    shutdown: CancellationToken,
    wire_format: WireFormatKind,
    tracing: bool,
}

impl TransportHandle {
    /// Whether `command` can be expressed on the negotiated wire format.
    pub(crate) fn supports(&self, command: &Command) -> bool {
        match self.wire_format {
            WireFormatKind::OpenWire => true,
            WireFormatKind::Stomp => StompCodec::supports(command),
        }
    }

    /// Submit a command without waiting for an answer.
    ///
    /// Commands the wire format cannot express are accepted and dropped;
    /// the broker has nothing to learn from them.
    pub(crate) async fn oneway(&self, command: Command) -> Result<()> {
        if !self.supports(&command) {
            log::trace!("answering {command} locally, no wire mapping");
            return Ok(());
        }
        if self.tracing {
            log::trace!("outbound {command}");
        }
        self.outbound
            .send(command)
            .await
            .map_err(|_| MessagingError::transport("transport closed"))
    }

    /// Submit a command and await its response within `deadline`.
    pub(crate) async fn request(
        &self,
        mut command: Command,
        deadline: Duration,
    ) -> Result<Response> {
        let (id, waiter) = self.correlator.register();
        command.header.command_id = Some(id);
        command.header.response_required = true;

        if !self.supports(&command) {
            // No broker dialogue required; answer locally.
            self.correlator.cancel(id);
            return Ok(Response { correlation_id: id });
        }
        if let Err(error) = self.oneway(command).await {
            self.correlator.cancel(id);
            return Err(error);
        }
        match timeout(deadline, waiter).await {
            Err(_) => {
                self.correlator.cancel(id);
                Err(MessagingError::Timeout)
            }
            Ok(Err(_)) => Err(MessagingError::transport(
                "transport closed while awaiting response",
            )),
            Ok(Ok(outcome)) => outcome,
        }
    }

    /// Stop the I/O task. Idempotent.
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.correlator
    }
}

/// Dial the broker and start the transport tasks.
pub(crate) async fn connect(
    config: TransportConfig,
) -> Result<(
    TransportHandle,
    mpsc::Receiver<TransportEvent>,
    Arc<RecoveryState>,
)> {
    let framed = tcp::dial_and_negotiate(&config).await?;

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
    let correlator = Arc::new(Correlator::new());
    let shutdown = CancellationToken::new();
    let recovery = Arc::new(RecoveryState::new());

    let handle = TransportHandle {
        outbound: outbound_tx,
        correlator: Arc::clone(&correlator),
        shutdown: shutdown.clone(),
        wire_format: config.uri.options.wire_format,
        tracing: config.uri.options.command_tracing_enabled,
    };

    tokio::spawn(supervise(
        config,
        framed,
        outbound_rx,
        event_tx,
        correlator,
        Arc::clone(&recovery),
        shutdown,
    ));

    Ok((handle, event_rx, recovery))
}

/// Why the I/O loop returned.
enum LoopExit {
    /// Close requested or every handle dropped.
    Shutdown,
}

async fn supervise(
    config: TransportConfig,
    framed: Framed<TcpStream, CommandCodec>,
    mut outbound: mpsc::Receiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    correlator: Arc<Correlator>,
    recovery: Arc<RecoveryState>,
    shutdown: CancellationToken,
) {
    let policy = FailoverPolicy::from_options(&config.uri.options);
    let mut current = framed;
    loop {
        let error = match run_io(
            &mut current,
            &mut outbound,
            &events,
            &correlator,
            &config,
            &shutdown,
        )
        .await
        {
            Ok(LoopExit::Shutdown) => {
                log::debug!("transport for {} shut down", config.connection_id);
                correlator
                    .fail_all(|| MessagingError::illegal_state("connection closed"));
                return;
            }
            Err(error) => error,
        };

        log::warn!("transport for {} failed: {error}", config.connection_id);
        let Some(policy) = policy else {
            correlator.fail_all(|| MessagingError::transport(error.to_string()));
            let _ = events.send(TransportEvent::Failed(error.to_string())).await;
            return;
        };

        let _ = events.send(TransportEvent::Interrupted).await;
        match reconnect(&config, policy, &recovery, &shutdown).await {
            Some(framed) => {
                current = framed;
                let _ = events.send(TransportEvent::Resumed).await;
            }
            None => {
                let reason = format!(
                    "reconnect exhausted after {} attempts: {error}",
                    policy.max_attempts
                );
                correlator.fail_all(|| MessagingError::transport(reason.clone()));
                let _ = events.send(TransportEvent::Failed(reason)).await;
                return;
            }
        }
    }
}

/// Dial, negotiate, and replay until success or the attempts run out.
async fn reconnect(
    config: &TransportConfig,
    policy: FailoverPolicy,
    recovery: &RecoveryState,
    shutdown: &CancellationToken,
) -> Option<Framed<TcpStream, CommandCodec>> {
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for(attempt);
        tokio::select! {
            () = shutdown.cancelled() => return None,
            () = sleep(delay) => {}
        }
        log::debug!(
            "reconnect attempt {attempt}/{} to {}",
            policy.max_attempts,
            config.uri
        );
        match try_restore(config, recovery).await {
            Ok(framed) => {
                log::debug!("reconnected to {} on attempt {attempt}", config.uri);
                return Some(framed);
            }
            Err(error) => log::warn!("reconnect attempt {attempt} failed: {error}"),
        }
    }
    None
}

async fn try_restore(
    config: &TransportConfig,
    recovery: &RecoveryState,
) -> Result<Framed<TcpStream, CommandCodec>> {
    let mut framed = tcp::dial_and_negotiate(config).await?;
    for command in recovery.snapshot() {
        framed.send(command).await?;
    }
    Ok(framed)
}

async fn run_io(
    framed: &mut Framed<TcpStream, CommandCodec>,
    outbound: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<TransportEvent>,
    correlator: &Correlator,
    config: &TransportConfig,
    shutdown: &CancellationToken,
) -> Result<LoopExit> {
    let tracing = config.uri.options.command_tracing_enabled;
    let mut monitor = InactivityMonitor::new(config.uri.options.max_inactivity_duration);
    let (mut sink, mut stream) = framed_halves(framed);

    loop {
        let write_check = monitor.write_check_at();
        let read_check = monitor.read_check_at();
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.flush().await;
                return Ok(LoopExit::Shutdown);
            }
            submitted = outbound.recv() => match submitted {
                Some(command) => {
                    sink.send(command).await?;
                    monitor.record_write();
                }
                None => return Ok(LoopExit::Shutdown),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(command)) => {
                    monitor.record_read();
                    if tracing {
                        log::trace!("inbound {command}");
                    }
                    dispatch_inbound(command, events, correlator).await?;
                }
                Some(Err(error)) => return Err(error),
                None => return Err(MessagingError::transport("connection closed by peer")),
            },
            () = sleep_until(write_check), if monitor.enabled() => {
                sink.send(Command::new(CommandBody::KeepAlive(KeepAlive))).await?;
                monitor.record_write();
            }
            () = sleep_until(read_check), if monitor.enabled() => {
                return Err(MessagingError::transport(format!(
                    "no inbound traffic for {:?}, peer presumed dead",
                    config.uri.options.max_inactivity_duration
                )));
            }
        }
    }
}

async fn dispatch_inbound(
    command: Command,
    events: &mpsc::Sender<TransportEvent>,
    correlator: &Correlator,
) -> Result<()> {
    match command {
        Command {
            body: CommandBody::Response(response),
            ..
        } => {
            correlator.offer_response(response);
            Ok(())
        }
        Command {
            body: CommandBody::ExceptionResponse(response),
            ..
        } if response.correlation_id >= 0 => {
            correlator.offer_exception(response);
            Ok(())
        }
        Command {
            body: CommandBody::ExceptionResponse(response),
            ..
        } => Err(MessagingError::Broker {
            message: response.message,
            exception_class: response.exception_class,
        }),
        Command {
            body: CommandBody::KeepAlive(_),
            ..
        } => Ok(()),
        other => {
            // Dropping the event receiver is an orderly teardown signal.
            if events.send(TransportEvent::Command(other)).await.is_err() {
                log::debug!("event channel closed, discarding inbound command");
            }
            Ok(())
        }
    }
}

type FramedSink<'a> = SplitSink<&'a mut Framed<TcpStream, CommandCodec>, Command>;
type FramedStream<'a> = SplitStream<&'a mut Framed<TcpStream, CommandCodec>>;

/// Split a framed transport so reads and writes can progress independently
/// inside one `select!` loop.
fn framed_halves(framed: &mut Framed<TcpStream, CommandCodec>) -> (FramedSink<'_>, FramedStream<'_>) {
    framed.split()
}
