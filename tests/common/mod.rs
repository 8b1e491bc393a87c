//! In-process broker double for integration tests.
//!
//! Speaks either wire format through the crate's own codecs, answers
//! `responseRequired` commands, keeps a per-destination message store,
//! and routes deliveries to registered subscriptions. Just enough broker
//! to exercise the client's lifecycles, ordering, and acknowledgement
//! behavior over real sockets.

// Each test binary uses its own subset of this helper's surface.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use wiremq::codec::CommandCodec;
use wiremq::command::{
    BrokerMessage, Command, CommandBody, ConsumerInfo, MessageAck, Response, TransactionInfo,
    WireFormatInfo,
};
use wiremq::{Destination, WireFormatKind};

const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Handle on the broker double.
pub struct MockBroker {
    addr: SocketAddr,
    kind: WireFormatKind,
    state: Arc<BrokerState>,
    accept_task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
pub struct BrokerState {
    /// Registered broker entities: connections, sessions, producers,
    /// consumers, destinations. Registrations increment, removals
    /// decrement.
    entities: AtomicI64,
    /// When set, `responseRequired` commands get no answer.
    withhold_responses: AtomicBool,
    /// Messages the broker holds, per destination, oldest first.
    store: Mutex<HashMap<String, Vec<BrokerMessage>>>,
    /// Live subscriptions across all connections.
    subscriptions: Mutex<Vec<Subscription>>,
    /// Every acknowledgement received.
    acks: Mutex<Vec<MessageAck>>,
    /// Every transaction command received, in arrival order.
    transactions: Mutex<Vec<TransactionInfo>>,
    /// Count of message pulls received.
    pulls: AtomicI64,
    /// Abrupt-kill switches for live connections.
    killers: Mutex<Vec<CancellationToken>>,
}

struct Subscription {
    info: ConsumerInfo,
    outbound: mpsc::Sender<Command>,
}

impl MockBroker {
    /// Start a broker double speaking `kind` on an ephemeral port.
    pub async fn start(kind: WireFormatKind) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(BrokerState::default());
        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let killer = CancellationToken::new();
                accept_state
                    .killers
                    .lock()
                    .expect("killers poisoned")
                    .push(killer.clone());
                tokio::spawn(serve(stream, kind, Arc::clone(&accept_state), killer));
            }
        });
        Self {
            addr,
            kind,
            state,
            accept_task,
        }
    }

    /// Broker URI with the wire format preselected.
    pub fn uri(&self) -> String {
        self.uri_with("")
    }

    /// Broker URI with extra query options appended.
    pub fn uri_with(&self, extra: &str) -> String {
        let wire_format = match self.kind {
            WireFormatKind::OpenWire => "openwire",
            WireFormatKind::Stomp => "stomp",
        };
        let mut uri = format!("tcp://127.0.0.1:{}?wireFormat={wire_format}", self.addr.port());
        if !extra.is_empty() {
            uri.push('&');
            uri.push_str(extra);
        }
        uri
    }

    /// Net count of registered broker entities.
    pub fn entity_count(&self) -> i64 {
        self.state.entities.load(Ordering::SeqCst)
    }

    /// Suppress answers to `responseRequired` commands.
    pub fn withhold_responses(&self, withhold: bool) {
        self.state
            .withhold_responses
            .store(withhold, Ordering::SeqCst);
    }

    /// Messages the broker currently holds for `destination`.
    pub fn stored(&self, destination: &Destination) -> Vec<BrokerMessage> {
        self.state
            .store
            .lock()
            .expect("store poisoned")
            .get(&destination.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Every acknowledgement received so far.
    pub fn acks(&self) -> Vec<MessageAck> {
        self.state.acks.lock().expect("acks poisoned").clone()
    }

    /// Every transaction command received so far, in arrival order.
    pub fn transactions(&self) -> Vec<TransactionInfo> {
        self.state
            .transactions
            .lock()
            .expect("transactions poisoned")
            .clone()
    }

    /// Number of message pulls received so far.
    pub fn pull_count(&self) -> i64 {
        self.state.pulls.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions, pruning ones whose connection died.
    pub fn subscription_count(&self) -> usize {
        let mut subscriptions = self
            .state
            .subscriptions
            .lock()
            .expect("subscriptions poisoned");
        subscriptions.retain(|subscription| !subscription.outbound.is_closed());
        subscriptions.len()
    }

    /// Drop every live socket without any protocol goodbye.
    pub fn kill_connections(&self) {
        let killers = std::mem::take(&mut *self.state.killers.lock().expect("killers poisoned"));
        for killer in killers {
            killer.cancel();
        }
    }

    /// Stop listening and drop every live socket: the broker is gone.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.kill_connections();
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
///
/// Oneway commands (acknowledgements in particular) race with the test
/// body; assertions about broker-side effects go through here.
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn serve(
    stream: TcpStream,
    kind: WireFormatKind,
    state: Arc<BrokerState>,
    killer: CancellationToken,
) {
    let framed = Framed::new(stream, CommandCodec::new(kind, MAX_FRAME));
    let (mut sink, mut stream) = framed.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Command>(256);

    loop {
        tokio::select! {
            () = killer.cancelled() => break,
            queued = outbound_rx.recv() => {
                let Some(command) = queued else { break };
                if sink.send(command).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(command)) => handle(command, kind, &state, &outbound_tx).await,
                    _ => break,
                }
            }
        }
    }

    // Connection gone: its subscriptions die with it.
    state
        .subscriptions
        .lock()
        .expect("subscriptions poisoned")
        .retain(|subscription| !subscription.outbound.is_closed());
}

async fn handle(
    command: Command,
    kind: WireFormatKind,
    state: &Arc<BrokerState>,
    outbound: &mpsc::Sender<Command>,
) {
    let mut respond = command.header.response_required;
    match command.body {
        CommandBody::WireFormatInfo(_) => {
            let _ = outbound
                .send(Command::new(CommandBody::WireFormatInfo(
                    WireFormatInfo::default(),
                )))
                .await;
            respond = false;
        }
        CommandBody::ConnectionInfo(_) => {
            state.entities.fetch_add(1, Ordering::SeqCst);
            if kind == WireFormatKind::Stomp {
                // The text protocol answers the connect frame immediately.
                let _ = outbound
                    .send(Command::new(CommandBody::WireFormatInfo(
                        WireFormatInfo::default(),
                    )))
                    .await;
            }
        }
        CommandBody::SessionInfo(_) | CommandBody::ProducerInfo(_) => {
            state.entities.fetch_add(1, Ordering::SeqCst);
        }
        CommandBody::DestinationInfo(info) => {
            use wiremq::command::DestinationOperation;
            match info.operation_type {
                DestinationOperation::Add => state.entities.fetch_add(1, Ordering::SeqCst),
                DestinationOperation::Remove => state.entities.fetch_sub(1, Ordering::SeqCst),
            };
        }
        CommandBody::ConsumerInfo(info) => {
            state.entities.fetch_add(1, Ordering::SeqCst);
            state
                .subscriptions
                .lock()
                .expect("subscriptions poisoned")
                .push(Subscription {
                    info: info.clone(),
                    outbound: outbound.clone(),
                });
            if info.prefetch_size > 0 {
                deliver_stored(state, &info, outbound).await;
            }
        }
        CommandBody::RemoveInfo(info) => {
            state.entities.fetch_sub(1, Ordering::SeqCst);
            if let wiremq::command::RemovedEntity::Consumer(id) = &info.object {
                state
                    .subscriptions
                    .lock()
                    .expect("subscriptions poisoned")
                    .retain(|subscription| subscription.info.consumer_id != *id);
            }
        }
        CommandBody::ShutdownInfo(_) => {
            state.entities.fetch_sub(1, Ordering::SeqCst);
        }
        CommandBody::Message(message) => {
            let Some(destination) = message.destination.clone() else {
                return;
            };
            state
                .store
                .lock()
                .expect("store poisoned")
                .entry(destination.to_string())
                .or_default()
                .push(message.clone());
            push_to_subscribers(state, &destination, &message).await;
        }
        CommandBody::MessageAck(ack) => {
            apply_ack(state, &ack);
            state.acks.lock().expect("acks poisoned").push(ack);
        }
        CommandBody::TransactionInfo(info) => {
            state
                .transactions
                .lock()
                .expect("transactions poisoned")
                .push(info);
        }
        CommandBody::MessagePull(pull) => {
            state.pulls.fetch_add(1, Ordering::SeqCst);
            let next = state
                .store
                .lock()
                .expect("store poisoned")
                .get_mut(&pull.destination.to_string())
                .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
            if let Some(mut message) = next {
                message.target_consumer_id = Some(pull.consumer_id.clone());
                let _ = outbound
                    .send(Command::new(CommandBody::Message(message)))
                    .await;
            }
        }
        CommandBody::KeepAlive(_)
        | CommandBody::ConsumerControl(_)
        | CommandBody::Response(_)
        | CommandBody::ExceptionResponse(_) => {}
    }

    if respond && !state.withhold_responses.load(Ordering::SeqCst) {
        let correlation_id = command.header.command_id.unwrap_or(-1);
        let _ = outbound
            .send(Command::new(CommandBody::Response(Response {
                correlation_id,
            })))
            .await;
    }
}

/// Push every stored message for the subscription's destination.
async fn deliver_stored(
    state: &Arc<BrokerState>,
    info: &ConsumerInfo,
    outbound: &mpsc::Sender<Command>,
) {
    let stored: Vec<BrokerMessage> = state
        .store
        .lock()
        .expect("store poisoned")
        .get(&info.destination.to_string())
        .cloned()
        .unwrap_or_default();
    for mut message in stored {
        message.target_consumer_id = Some(info.consumer_id.clone());
        let _ = outbound
            .send(Command::new(CommandBody::Message(message)))
            .await;
    }
}

/// Push a newly published message to matching push-mode subscriptions.
async fn push_to_subscribers(
    state: &Arc<BrokerState>,
    destination: &Destination,
    message: &BrokerMessage,
) {
    let matching: Vec<(ConsumerInfo, mpsc::Sender<Command>)> = state
        .subscriptions
        .lock()
        .expect("subscriptions poisoned")
        .iter()
        .filter(|subscription| {
            subscription.info.destination == *destination && subscription.info.prefetch_size > 0
        })
        .map(|subscription| (subscription.info.clone(), subscription.outbound.clone()))
        .collect();
    for (info, outbound) in matching {
        let mut delivery = message.clone();
        delivery.target_consumer_id = Some(info.consumer_id.clone());
        let _ = outbound
            .send(Command::new(CommandBody::Message(delivery)))
            .await;
    }
}

/// A standard acknowledgement consumes the covered window from the store.
fn apply_ack(state: &Arc<BrokerState>, ack: &MessageAck) {
    use wiremq::command::AckType;
    if ack.ack_type != AckType::Standard {
        return;
    }
    let Some(destination) = &ack.destination else {
        return;
    };
    let mut store = state.store.lock().expect("store poisoned");
    if let Some(queue) = store.get_mut(&destination.to_string()) {
        let count = usize::try_from(ack.message_count).unwrap_or(0).min(queue.len());
        queue.drain(..count);
    }
}
